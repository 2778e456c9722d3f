use std::sync::Arc;

use datamap_core::traits::{Generator, GeneratorInput};
use datamap_core::types::FieldValue;
use datamap_embed::{get_default_embedder, EmbeddingGenerator, FakeEmbedder};

#[test]
fn fake_embedder_shapes_and_determinism() {
    // Force fake embedder to avoid loading large model
    std::env::set_var("APP_USE_FAKE_EMBEDDINGS", "1");

    let embedder = get_default_embedder().expect("embedder");
    let texts = vec!["hello world".to_string(), "hello world".to_string()];
    let embs = embedder.embed_batch(&texts).expect("embed_batch");
    let v1 = &embs[0];
    let v2 = &embs[1];

    assert_eq!(v1.len(), 1024, "embedding dim is 1024");
    let norm: f32 = v1.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() <= 1e-3, "vector is L2-normalized (norm={norm})");
    for (a, b) in v1.iter().zip(v2.iter()) {
        assert!((a - b).abs() <= 1e-6);
    }
}

#[tokio::test]
async fn generator_embeds_text_and_lists() -> anyhow::Result<()> {
    let generator = EmbeddingGenerator::new("embed", Arc::new(FakeEmbedder::new(16)));
    let batch = vec![
        GeneratorInput::text("graphene transistors"),
        GeneratorInput::Values(vec![FieldValue::TextList(vec!["first chunk".into(), "second chunk".into()])]),
        GeneratorInput::Values(Vec::new()),
    ];
    let out = generator.generate(&batch).await?;
    assert_eq!(out.len(), 3);
    assert!(matches!(&out[0].value, Some(FieldValue::Vector(v)) if v.len() == 16));
    assert!(matches!(&out[1].value, Some(FieldValue::VectorList(vs)) if vs.len() == 2 && vs.iter().all(|v| v.len() == 16)));
    assert!(out[2].value.is_none(), "no text, no vector");
    Ok(())
}

#[test]
#[ignore = "needs the BGE-M3 weights on disk"]
fn model_embeds_to_1024_dims() {
    let model = datamap_embed::EmbeddingModel::new(None).expect("model");
    let out = datamap_embed::Embedder::embed_batch(&model, &["hello".to_string()]).expect("embed");
    assert_eq!(out[0].len(), 1024);
}
