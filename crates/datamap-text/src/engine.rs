use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::directory::MmapDirectory;
use tantivy::query::{AllQuery, BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{Field, IndexRecordOption, Value};
use tantivy::snippet::SnippetGenerator;
use tantivy::{DocAddress, Index, IndexReader, IndexWriter, ReloadPolicy, Searcher, TantivyDocument, Term};

use datamap_core::params::Filter;
use datamap_core::schema::Dataset;
use datamap_core::traits::{KeywordQuery, TextEngine};
use datamap_core::types::{DatasetId, EngineHit, FieldValue, Item, ItemId};
use datamap_core::{Error, Result};

use crate::tantivy_utils::{build_schema, classify_fields, register_tokenizer, ID_FIELD, PRESENT_FIELD, SOURCE_FIELD};

const WRITER_HEAP: usize = 50_000_000;

fn engine_err(e: impl std::fmt::Display) -> Error {
	Error::upstream("tantivy", e)
}

struct DatasetIndex {
	index: Index,
	reader: IndexReader,
	writer: Mutex<IndexWriter>,
	id_field: Field,
	source_field: Field,
	present_field: Field,
	text_fields: HashMap<String, Field>,
	raw_fields: HashMap<String, Field>,
}

impl DatasetIndex {
	fn open(index: Index) -> Result<Self> {
		register_tokenizer(&index);
		let schema = index.schema();
		let id_field = schema.get_field(ID_FIELD).map_err(engine_err)?;
		let source_field = schema.get_field(SOURCE_FIELD).map_err(engine_err)?;
		let present_field = schema.get_field(PRESENT_FIELD).map_err(engine_err)?;
		let (text, raw) = classify_fields(&schema);
		let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into().map_err(engine_err)?;
		let writer = index.writer(WRITER_HEAP).map_err(engine_err)?;
		Ok(Self {
			index,
			reader,
			writer: Mutex::new(writer),
			id_field,
			source_field,
			present_field,
			text_fields: text.into_iter().collect(),
			raw_fields: raw.into_iter().collect(),
		})
	}

	fn to_document(&self, item: &Item) -> Result<TantivyDocument> {
		let mut doc = TantivyDocument::default();
		doc.add_text(self.id_field, &item.id);
		doc.add_text(self.source_field, serde_json::to_string(&item.fields)?);
		for (name, value) in &item.fields {
			if value.is_truthy() {
				doc.add_text(self.present_field, name);
			}
			if let Some(field) = self.text_fields.get(name) {
				if let Some(text) = value.to_text() {
					doc.add_text(*field, text);
				}
			}
			if let Some(field) = self.raw_fields.get(name) {
				match value {
					FieldValue::TextList(values) => values.iter().for_each(|v| doc.add_text(*field, v)),
					other => {
						if let Some(text) = other.to_text() {
							doc.add_text(*field, text);
						}
					}
				}
			}
		}
		Ok(doc)
	}

	fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
		writer.commit().map_err(engine_err)?;
		self.reader.reload().map_err(engine_err)
	}

	fn load_item(&self, searcher: &Searcher, dataset_id: DatasetId, addr: DocAddress) -> Result<Item> {
		let doc: TantivyDocument = searcher.doc(addr).map_err(engine_err)?;
		let id = doc.get_first(self.id_field).and_then(|v| v.as_str()).unwrap_or_default().to_string();
		let source = doc.get_first(self.source_field).and_then(|v| v.as_str()).unwrap_or("{}");
		let fields: BTreeMap<String, FieldValue> = serde_json::from_str(source).map_err(engine_err)?;
		Ok(Item { dataset_id, id, fields })
	}

	fn filter_clauses(&self, filters: &[Filter]) -> Result<Vec<(Occur, Box<dyn Query>)>> {
		filters
			.iter()
			.map(|f| {
				let field = self.raw_fields.get(&f.field).ok_or_else(|| Error::Validation(format!("field '{}' is not filterable", f.field)))?;
				let term = Term::from_field_text(*field, &f.value);
				Ok((Occur::Must, Box::new(TermQuery::new(term, IndexRecordOption::Basic)) as Box<dyn Query>))
			})
			.collect()
	}
}

/// Tantivy index per dataset under `<root>/ds<id>`.
pub struct TantivyTextEngine {
	root: PathBuf,
	indexes: RwLock<HashMap<DatasetId, Arc<DatasetIndex>>>,
}

impl TantivyTextEngine {
	pub fn new(root: PathBuf) -> Result<Self> {
		std::fs::create_dir_all(&root).map_err(|e| Error::InvalidConfig(format!("creating {}: {e}", root.display())))?;
		Ok(Self { root, indexes: RwLock::new(HashMap::new()) })
	}

	fn dataset_dir(&self, dataset_id: DatasetId) -> PathBuf {
		self.root.join(format!("ds{dataset_id}"))
	}

	fn dataset_index(&self, dataset_id: DatasetId) -> Result<Arc<DatasetIndex>> {
		if let Some(idx) = self.indexes.read().get(&dataset_id) {
			return Ok(idx.clone());
		}
		let dir = self.dataset_dir(dataset_id);
		if !dir.join("meta.json").exists() {
			return Err(Error::NotFound(format!("text index for dataset {dataset_id}")));
		}
		let index = Index::open_in_dir(&dir).map_err(engine_err)?;
		let opened = Arc::new(DatasetIndex::open(index)?);
		self.indexes.write().insert(dataset_id, opened.clone());
		Ok(opened)
	}
}

#[async_trait]
impl TextEngine for TantivyTextEngine {
	async fn ensure_index(&self, dataset: &Dataset) -> Result<()> {
		if self.indexes.read().contains_key(&dataset.id) {
			return Ok(());
		}
		let dir = self.dataset_dir(dataset.id);
		std::fs::create_dir_all(&dir).map_err(engine_err)?;
		let directory = MmapDirectory::open(&dir).map_err(engine_err)?;
		let index = Index::open_or_create(directory, build_schema(dataset)).map_err(engine_err)?;
		let opened = Arc::new(DatasetIndex::open(index)?);
		self.indexes.write().insert(dataset.id, opened);
		tracing::debug!(dataset_id = dataset.id, dir = %dir.display(), "text index ready");
		Ok(())
	}

	async fn item_count(&self, dataset_id: DatasetId) -> Result<usize> {
		let idx = self.dataset_index(dataset_id)?;
		usize::try_from(idx.reader.searcher().num_docs()).map_err(engine_err)
	}

	async fn get_by_ids(&self, dataset_id: DatasetId, ids: &[ItemId], fields: &[String]) -> Result<Vec<Item>> {
		let idx = self.dataset_index(dataset_id)?;
		let searcher = idx.reader.searcher();
		let mut items = Vec::with_capacity(ids.len());
		for id in ids {
			let query = TermQuery::new(Term::from_field_text(idx.id_field, id), IndexRecordOption::Basic);
			let Some((_, addr)) = searcher.search(&query, &TopDocs::with_limit(1)).map_err(engine_err)?.into_iter().next() else {
				continue;
			};
			let mut item = idx.load_item(&searcher, dataset_id, addr)?;
			if !fields.is_empty() {
				item.fields.retain(|name, _| fields.contains(name));
			}
			items.push(item);
		}
		Ok(items)
	}

	async fn search(&self, query: &KeywordQuery) -> Result<Vec<EngineHit>> {
		let idx = self.dataset_index(query.dataset_id)?;
		let searched: Vec<(String, Field, f32)> = query
			.fields
			.iter()
			.filter_map(|(name, boost)| idx.text_fields.get(name).map(|f| (name.clone(), *f, *boost)))
			.collect();
		if searched.is_empty() || query.limit == 0 {
			return Ok(Vec::new());
		}
		let mut parser = QueryParser::for_index(&idx.index, searched.iter().map(|(_, f, _)| *f).collect());
		for (_, field, boost) in &searched {
			parser.set_field_boost(*field, *boost);
		}
		let (parsed, errors) = parser.parse_query_lenient(&query.query);
		if !errors.is_empty() {
			tracing::debug!(query = %query.query, errors = errors.len(), "query parsed leniently");
		}
		let text_query: Box<dyn Query> = if query.filters.is_empty() {
			parsed
		} else {
			let mut clauses = vec![(Occur::Must, parsed)];
			clauses.extend(idx.filter_clauses(&query.filters)?);
			Box::new(BooleanQuery::new(clauses))
		};

		let searcher = idx.reader.searcher();
		let top_docs = searcher.search(&*text_query, &TopDocs::with_limit(query.limit)).map_err(engine_err)?;
		let generators: Vec<(String, SnippetGenerator)> = if query.highlight {
			searched
				.iter()
				.filter_map(|(name, field, _)| SnippetGenerator::create(&searcher, &*text_query, *field).ok().map(|g| (name.clone(), g)))
				.collect()
		} else {
			Vec::new()
		};

		let mut hits = Vec::with_capacity(top_docs.len());
		for (score, addr) in top_docs {
			let item = idx.load_item(&searcher, query.dataset_id, addr)?;
			let snippets: Vec<String> = generators
				.iter()
				.filter_map(|(name, generator)| {
					let text = item.get(name)?.to_text()?;
					let snippet = generator.snippet(&text);
					(!snippet.highlighted().is_empty()).then(|| snippet.to_html())
				})
				.collect();
			hits.push(EngineHit {
				id: item.id,
				score,
				highlights: (!snippets.is_empty()).then(|| snippets.join(" ")),
				relevant_parts: Vec::new(),
			});
		}
		Ok(hits)
	}

	async fn items_missing_field(&self, dataset_id: DatasetId, field: &str, limit: usize) -> Result<Vec<Item>> {
		let idx = self.dataset_index(dataset_id)?;
		if limit == 0 {
			return Ok(Vec::new());
		}
		let present = TermQuery::new(Term::from_field_text(idx.present_field, field), IndexRecordOption::Basic);
		let missing = BooleanQuery::new(vec![
			(Occur::Must, Box::new(AllQuery) as Box<dyn Query>),
			(Occur::MustNot, Box::new(present)),
		]);
		let searcher = idx.reader.searcher();
		let top_docs = searcher.search(&missing, &TopDocs::with_limit(limit)).map_err(engine_err)?;
		top_docs.into_iter().map(|(_, addr)| idx.load_item(&searcher, dataset_id, addr)).collect()
	}

	async fn upsert(&self, dataset_id: DatasetId, items: &[Item]) -> Result<()> {
		let idx = self.dataset_index(dataset_id)?;
		let mut writer = idx.writer.lock();
		for item in items {
			writer.delete_term(Term::from_field_text(idx.id_field, &item.id));
			writer.add_document(idx.to_document(item)?).map_err(engine_err)?;
		}
		idx.commit(&mut writer)?;
		tracing::debug!(dataset_id, count = items.len(), "text upsert committed");
		Ok(())
	}

	async fn delete(&self, dataset_id: DatasetId, ids: &[ItemId]) -> Result<()> {
		let idx = self.dataset_index(dataset_id)?;
		let mut writer = idx.writer.lock();
		for id in ids {
			writer.delete_term(Term::from_field_text(idx.id_field, id));
		}
		idx.commit(&mut writer)
	}
}
