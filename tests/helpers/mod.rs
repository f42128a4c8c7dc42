#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use memory_crystal::db;
use memory_crystal::embedding::EmbeddingClient;
use rusqlite::Connection;
use std::collections::HashMap;

/// Open a fresh in-memory store with schema and migrations applied.
pub fn test_db() -> Connection {
    db::load_sqlite_vec();
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_schema(&conn).unwrap();
    db::migrations::run_migrations(&conn).unwrap();
    conn
}

/// Deterministic offline embedder.
///
/// Unknown texts get a bag-of-word-prefixes vector (first five characters of
/// each word, hashed into the dimensions), so texts sharing words land near
/// each other. Tests needing exact geometry register fixed vectors with
/// [`StubEmbedder::with_vector`].
pub struct StubEmbedder {
    dims: usize,
    fixed: HashMap<String, Vec<f32>>,
}

impl StubEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            fixed: HashMap::new(),
        }
    }

    pub fn with_vector(mut self, text: &str, vector: Vec<f32>) -> Self {
        assert_eq!(vector.len(), self.dims, "fixed vector has wrong dimension");
        self.fixed.insert(text.to_string(), l2_normalize(vector));
        self
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(v) = self.fixed.get(text) {
            return v.clone();
        }

        let mut v = vec![0.0f32; self.dims];
        for word in text.to_lowercase().split_whitespace() {
            let token: String = word
                .chars()
                .filter(|c| c.is_alphanumeric())
                .take(5)
                .collect();
            if token.is_empty() {
                continue;
            }
            let mut h: u64 = 0xcbf29ce484222325;
            for b in token.bytes() {
                h ^= b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % self.dims as u64) as usize] += 1.0;
        }
        l2_normalize(v)
    }
}

#[async_trait]
impl EmbeddingClient for StubEmbedder {
    fn provider_label(&self) -> String {
        "stub/test".into()
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Unit vector with a spike at one dimension.
pub fn spike(dims: usize, at: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dims];
    v[at % dims] = 1.0;
    v
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
