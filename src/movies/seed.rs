//! Initial catalog data.
//!
//! The seed file is a JSON array of `{ "title", "year" }` objects. `year`
//! may be a number or a numeric string; any other fields (such as an
//! exported `_id`) are ignored. Seeding only happens on an empty catalog.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use super::{MovieRepository, NewMovie, ServiceError};

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("failed to read seed file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse seed file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid year '{year}' for '{title}'")]
    InvalidYear { title: String, year: String },

    #[error("failed to store seed data: {0}")]
    Storage(#[from] ServiceError),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SeedYear {
    Number(i32),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct SeedEntry {
    title: String,
    year: SeedYear,
}

/// Parse seed file contents.
pub fn parse_seed(content: &str) -> Result<Vec<NewMovie>, SeedError> {
    let entries: Vec<SeedEntry> = serde_json::from_str(content)?;

    entries
        .into_iter()
        .map(|entry| -> Result<NewMovie, SeedError> {
            let year = match entry.year {
                SeedYear::Number(year) => year,
                SeedYear::Text(text) => {
                    text.trim()
                        .parse::<i32>()
                        .map_err(|_| SeedError::InvalidYear {
                            title: entry.title.clone(),
                            year: text.clone(),
                        })?
                }
            };
            Ok(NewMovie {
                title: entry.title,
                year,
            })
        })
        .collect()
}

/// Load the seed file into `repo` if the catalog is empty.
///
/// Returns the number of movies inserted.
pub async fn seed_if_empty(repo: &dyn MovieRepository, path: &Path) -> Result<usize, SeedError> {
    let existing = repo.count().await?;
    if existing > 0 {
        info!(existing = existing, "Catalog already populated, skipping seed");
        return Ok(0);
    }

    info!(path = %path.display(), "Catalog empty, loading seed file");
    let content = fs::read_to_string(path)?;
    let movies = parse_seed(&content)?;
    let inserted = repo.insert_many(movies).await?;

    info!(inserted = inserted, "Catalog seeded");
    Ok(inserted)
}
