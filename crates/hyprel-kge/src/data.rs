//! Dataset loading and vocabulary.
//!
//! One statement per line, comma separated:
//!
//! ```text
//! # subject,relation,object[,qualifier_relation,qualifier_entity]*
//! Einstein,educated_at,ETH_Zurich,academic_degree,BSc,end_time,1900
//! ETH_Zurich,located_in,Zurich
//! ```
//!
//! Id `0` of both vocabularies is the padding token [`PAD`].

use std::collections::HashMap;
use std::path::Path;

use hyprel_nn::Statement;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Padding token at id 0.
pub const PAD: &str = "__na__";

/// Bidirectional name/id mapping for entities and relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    entities: Vec<String>,
    relations: Vec<String>,
    #[serde(skip)]
    entity_ids: HashMap<String, u32>,
    #[serde(skip)]
    relation_ids: HashMap<String, u32>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}

impl Vocabulary {
    pub fn new() -> Self {
        let mut vocab = Self {
            entities: Vec::new(),
            relations: Vec::new(),
            entity_ids: HashMap::new(),
            relation_ids: HashMap::new(),
        };
        vocab.add_entity(PAD);
        vocab.add_relation(PAD);
        vocab
    }

    /// Id of `name`, inserting it if unseen.
    pub fn add_entity(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.entity_ids.get(name) {
            return id;
        }
        let id = self.entities.len() as u32;
        self.entities.push(name.to_string());
        self.entity_ids.insert(name.to_string(), id);
        id
    }

    /// Id of `name`, inserting it if unseen.
    pub fn add_relation(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.relation_ids.get(name) {
            return id;
        }
        let id = self.relations.len() as u32;
        self.relations.push(name.to_string());
        self.relation_ids.insert(name.to_string(), id);
        id
    }

    pub fn entity_id(&self, name: &str) -> Result<u32> {
        self.entity_ids
            .get(name)
            .copied()
            .ok_or_else(|| Error::EntityNotFound(name.to_string()))
    }

    pub fn relation_id(&self, name: &str) -> Result<u32> {
        self.relation_ids
            .get(name)
            .copied()
            .ok_or_else(|| Error::RelationNotFound(name.to_string()))
    }

    pub fn entity_name(&self, id: u32) -> Option<&str> {
        self.entities.get(id as usize).map(String::as_str)
    }

    pub fn relation_name(&self, id: u32) -> Option<&str> {
        self.relations.get(id as usize).map(String::as_str)
    }

    /// Entity count, padding included.
    pub fn num_entities(&self) -> usize {
        self.entities.len()
    }

    /// Relation count, padding included.
    pub fn num_relations(&self) -> usize {
        self.relations.len()
    }

    /// Read a vocabulary written by [`Vocabulary::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut vocab: Vocabulary = serde_json::from_str(&text)?;
        let padded = |names: &[String]| names.first().map(String::as_str) == Some(PAD);
        if !padded(&vocab.entities) || !padded(&vocab.relations) {
            return Err(Error::Validation(format!(
                "vocabulary must start with the padding token {PAD}"
            )));
        }
        vocab.reindex();
        Ok(vocab)
    }

    /// Write the id order as JSON, so later runs keep the same ids.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Rebuild the lookup maps after deserialization.
    fn reindex(&mut self) {
        self.entity_ids = self
            .entities
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
        self.relation_ids = self
            .relations
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
    }
}

/// Parse statements, growing `vocab` with every new name.
pub fn parse_statements(text: &str, vocab: &mut Vocabulary) -> Result<Vec<Statement>> {
    let mut statements = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        statements.push(parse_line(line, i + 1, vocab)?);
    }
    Ok(statements)
}

fn parse_line(line: &str, line_no: usize, vocab: &mut Vocabulary) -> Result<Statement> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 || fields.len() % 2 == 0 {
        return Err(Error::Parse {
            line: line_no,
            message: format!(
                "expected subject,relation,object followed by qualifier pairs, got {} fields",
                fields.len()
            ),
        });
    }
    if let Some(pos) = fields.iter().position(|f| f.is_empty()) {
        return Err(Error::Parse {
            line: line_no,
            message: format!("field {} is empty", pos + 1),
        });
    }

    let mut statement = Statement::new(
        vocab.add_entity(fields[0]),
        vocab.add_relation(fields[1]),
        vocab.add_entity(fields[2]),
    );
    for pair in fields[3..].chunks_exact(2) {
        let qr = vocab.add_relation(pair[0]);
        let qv = vocab.add_entity(pair[1]);
        statement = statement.with_qualifier(qr, qv);
    }
    Ok(statement)
}

/// Read and parse a dataset file.
pub fn load_statements(path: impl AsRef<Path>, vocab: &mut Vocabulary) -> Result<Vec<Statement>> {
    let text = std::fs::read_to_string(path)?;
    parse_statements(&text, vocab)
}

/// Counts over a statement set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatasetStats {
    pub entities: usize,
    pub relations: usize,
    pub statements: usize,
    pub qualified_statements: usize,
    pub qualifiers: usize,
}

impl DatasetStats {
    /// Vocabulary sizes exclude padding.
    pub fn compute(statements: &[Statement], vocab: &Vocabulary) -> Self {
        Self {
            entities: vocab.num_entities().saturating_sub(1),
            relations: vocab.num_relations().saturating_sub(1),
            statements: statements.len(),
            qualified_statements: statements.iter().filter(|s| !s.qualifiers.is_empty()).count(),
            qualifiers: statements.iter().map(|s| s.qualifiers.len()).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment
a,likes,b,since,y2020
b,likes,c

c,knows,a,since,y2020,via,b
";

    #[test]
    fn test_parse_assigns_ids_after_padding() {
        let mut vocab = Vocabulary::new();
        let statements = parse_statements(SAMPLE, &mut vocab).unwrap();
        assert_eq!(statements.len(), 3);

        assert_eq!(vocab.entity_id(PAD).unwrap(), 0);
        assert_eq!(vocab.entity_id("a").unwrap(), 1);
        assert_eq!(vocab.relation_id("likes").unwrap(), 1);
        assert_eq!(statements[0], Statement::new(1, 1, 2).with_qualifier(2, 3));
        assert_eq!(statements[2].qualifiers.len(), 2);
    }

    #[test]
    fn test_stats() {
        let mut vocab = Vocabulary::new();
        let statements = parse_statements(SAMPLE, &mut vocab).unwrap();
        let stats = DatasetStats::compute(&statements, &vocab);
        assert_eq!(
            stats,
            DatasetStats {
                entities: 4,
                relations: 4,
                statements: 3,
                qualified_statements: 2,
                qualifiers: 3,
            }
        );
    }

    #[test]
    fn test_malformed_lines() {
        let mut vocab = Vocabulary::new();
        let err = parse_statements("a,b,c\na,b", &mut vocab).unwrap_err();
        assert!(matches!(err, Error::Parse { line: 2, .. }));

        let err = parse_statements("a,b,c,q", &mut vocab).unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));

        let err = parse_statements("a,,c", &mut vocab).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }));
    }

    #[test]
    fn test_lookup_failures() {
        let vocab = Vocabulary::new();
        assert!(matches!(vocab.entity_id("x"), Err(Error::EntityNotFound(_))));
        assert!(matches!(vocab.relation_id("x"), Err(Error::RelationNotFound(_))));
    }

    #[test]
    fn test_save_and_load_keep_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        let mut vocab = Vocabulary::new();
        parse_statements(SAMPLE, &mut vocab).unwrap();
        vocab.save(&path).unwrap();

        let mut back = Vocabulary::load(&path).unwrap();
        assert_eq!(back, vocab);
        assert_eq!(back.entity_id("c").unwrap(), 4);
        assert_eq!(back.entity_name(4), Some("c"));

        // new names continue after the saved ones
        let next = back.num_entities() as u32;
        assert_eq!(back.add_entity("zeta"), next);
        assert_eq!(back.add_entity("c"), 4);
    }

    #[test]
    fn test_load_rejects_unpadded_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");
        std::fs::write(&path, r#"{ "entities": ["a"], "relations": ["__na__"] }"#).unwrap();
        assert!(matches!(Vocabulary::load(&path), Err(Error::Validation(_))));
    }
}
