use tantivy::schema::{Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, STORED, STRING};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, StopWordFilter, TextAnalyzer};
use tantivy::Index;

use datamap_core::schema::Dataset;

pub const ID_FIELD: &str = "_id";
pub const SOURCE_FIELD: &str = "_source";
/// Names of the fields populated on a document, for missing-field scans.
pub const PRESENT_FIELD: &str = "_present";
pub const RAW_SUFFIX: &str = "__raw";
pub const TOKENIZER: &str = "text_with_stopwords";

pub fn raw_name(field: &str) -> String {
	format!("{field}{RAW_SUFFIX}")
}

/// Keyword-searchable fields are tokenized, filterable fields get an exact
/// `<name>__raw` twin. The full item is kept as JSON in `_source`.
pub fn build_schema(dataset: &Dataset) -> Schema {
	let mut schema_builder = Schema::builder();
	schema_builder.add_text_field(ID_FIELD, STRING | STORED);
	schema_builder.add_text_field(SOURCE_FIELD, STORED);
	schema_builder.add_text_field(PRESENT_FIELD, STRING);
	let text_field_indexing = TextFieldIndexing::default().set_tokenizer(TOKENIZER).set_index_option(IndexRecordOption::WithFreqsAndPositions);
	let text_options = TextOptions::default().set_indexing_options(text_field_indexing);
	for field in dataset.fields.iter().filter(|f| !f.is_vector()) {
		if field.search.keyword {
			schema_builder.add_text_field(&field.identifier, text_options.clone());
		}
		if field.filterable {
			schema_builder.add_text_field(&raw_name(&field.identifier), STRING);
		}
	}
	schema_builder.build()
}

/// Split a schema into (tokenized, exact-match) fields keyed by item field name.
pub fn classify_fields(schema: &Schema) -> (Vec<(String, Field)>, Vec<(String, Field)>) {
	let mut text = Vec::new();
	let mut raw = Vec::new();
	for (field, entry) in schema.fields() {
		let name = entry.name();
		if [ID_FIELD, SOURCE_FIELD, PRESENT_FIELD].contains(&name) {
			continue;
		}
		match name.strip_suffix(RAW_SUFFIX) {
			Some(base) => raw.push((base.to_string(), field)),
			None => text.push((name.to_string(), field)),
		}
	}
	(text, raw)
}

pub fn register_tokenizer(index: &Index) {
	let stop_words = vec![
		"a","an","and","are","as","at","be","by","for","from","has","he","in","is","it","its","of","on","that","the","to","was","will","with","or","but","not","this","these","they","them","their","there","then","than","so","if","when","where","why","how","what","which","who","whom","whose","can","could","should","would","may","might","must","shall","do","does","did","have","had","having",
	];
	let tokenizer = TextAnalyzer::builder(SimpleTokenizer::default())
		.filter(LowerCaser)
		.filter(StopWordFilter::remove(stop_words.into_iter().map(|s| s.to_string())))
		.build();
	index.tokenizers().register(TOKENIZER, tokenizer);
}
