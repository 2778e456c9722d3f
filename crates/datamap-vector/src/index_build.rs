//! IVF_PQ index management for quantized collections.
//!
//! Small collections are searched exactly. Once a quantized collection holds
//! enough rows to train product quantization, an IVF_PQ index is built under
//! a name derived from the table and rebuilt only when it is missing.
use lancedb::index::vector::IvfPqIndexBuilder;
use lancedb::index::Index;
use lancedb::{Connection, DistanceType};

use datamap_core::Result;

use crate::engine_err;
use crate::schema::VECTOR;

/// PQ codebooks need 2^nbits training rows.
pub const MIN_ROWS_FOR_PQ: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfPqParams {
    pub nlist: usize,
    pub m: usize,
    pub nbits: usize,
}

pub fn compute_ivfpq_params(total_ready: usize, dim: usize) -> IvfPqParams {
    let sqrt_n = (total_ready as f64).sqrt() as usize;
    let mut nlist = std::cmp::min(2 * sqrt_n, 65536);
    // keep at least MIN_ROWS_FOR_PQ rows per partition
    nlist = std::cmp::min(nlist, total_ready / MIN_ROWS_FOR_PQ).max(1);
    let m = [32, 16, 8, 4, 2].into_iter().find(|&m| m < dim && dim % m == 0).unwrap_or(1);
    IvfPqParams { nlist, m, nbits: 8 }
}

pub fn index_name(table_name: &str) -> String {
    format!("{table_name}_ivfpq")
}

pub async fn has_vector_index(conn: &Connection, table_name: &str) -> Result<bool> {
    let table = conn.open_table(table_name).execute().await.map_err(engine_err)?;
    let indices = table.list_indices().await.map_err(engine_err)?;
    Ok(indices.iter().any(|i| i.columns.iter().any(|c| c == VECTOR)))
}

pub async fn build_ivfpq_index(conn: &Connection, table_name: &str, params: &IvfPqParams) -> Result<()> {
    let table = conn.open_table(table_name).execute().await.map_err(engine_err)?;
    table
        .create_index(
            &[VECTOR],
            Index::IvfPq(
                IvfPqIndexBuilder::default()
                    .distance_type(DistanceType::Cosine)
                    .num_partitions(params.nlist as u32)
                    .num_sub_vectors(params.m as u32),
            ),
        )
        .name(index_name(table_name))
        .replace(true)
        .execute()
        .await
        .map_err(engine_err)?;
    tracing::info!(table = table_name, nlist = params.nlist, m = params.m, "ivf_pq index built");
    Ok(())
}
