//! Known collections and the object naming conventions discovery applies.

use serde::Serialize;

use crate::error::CoreError;

/// How a collection's item source is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionType {
    ObjectStore,
    UrlEndpoint,
}

/// Where the four-digit year sits in an object's file stem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum YearToken {
    /// Stem is exactly the year (`2021.ndjson`).
    Exact,
    /// Stem starts with the year and is not followed by another digit (`2021a.ndjson`).
    Leading,
}

/// Filename rule for candidate objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NamingConvention {
    pub suffix: &'static str,
    pub year_token: YearToken,
}

impl NamingConvention {
    /// Convention used when a job names no collection.
    pub const DEFAULT: NamingConvention = NamingConvention {
        suffix: ".ndjson",
        year_token: YearToken::Leading,
    };

    /// Returns the year token of `key` if its filename follows this convention.
    pub fn year_of(&self, key: &str) -> Option<i32> {
        let filename = key.rsplit('/').next()?;
        let stem = filename.strip_suffix(self.suffix)?;
        let digits = stem.get(..4)?;
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let rest = &stem[4..];
        let accepted = match self.year_token {
            YearToken::Exact => rest.is_empty(),
            YearToken::Leading => !rest.starts_with(|c: char| c.is_ascii_digit()),
        };
        if accepted {
            digits.parse().ok()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionConfig {
    pub id: &'static str,
    pub ingestion_type: IngestionType,
    /// `None` for collections that are not discovered from an object store.
    pub naming: Option<NamingConvention>,
    pub description: &'static str,
}

const EXACT_YEAR_NDJSON: NamingConvention = NamingConvention {
    suffix: ".ndjson",
    year_token: YearToken::Exact,
};

static COLLECTIONS: &[CollectionConfig] = &[
    CollectionConfig {
        id: "itslive-cubes",
        ingestion_type: IngestionType::ObjectStore,
        naming: Some(EXACT_YEAR_NDJSON),
        description: "Cloud optimized Zarr cubes with datacube extensions",
    },
    CollectionConfig {
        id: "velocity-mosaics",
        ingestion_type: IngestionType::ObjectStore,
        naming: Some(EXACT_YEAR_NDJSON),
        description: "Regional glacier velocity mosaics (annual and static)",
    },
    CollectionConfig {
        id: "velocity-granules",
        ingestion_type: IngestionType::UrlEndpoint,
        naming: None,
        description: "Individual Landsat image-pair velocities",
    },
];

pub fn get(id: &str) -> Option<&'static CollectionConfig> {
    COLLECTIONS.iter().find(|c| c.id == id)
}

pub fn list_all() -> &'static [CollectionConfig] {
    COLLECTIONS
}

/// Naming convention discovery should apply for a job's collection.
pub fn naming_for(collection_id: Option<&str>) -> Result<NamingConvention, CoreError> {
    match collection_id {
        None => Ok(NamingConvention::DEFAULT),
        Some(id) => get(id)
            .ok_or_else(|| CoreError::UnknownCollection(id.to_string()))?
            .naming
            .ok_or_else(|| {
                CoreError::Other(format!("collection '{id}' is not ingested from an object store"))
            }),
    }
}
