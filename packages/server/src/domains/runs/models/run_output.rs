//! Run output artifacts and their merge semantics.
//!
//! Machines report outputs incrementally and may repeat themselves.
//! Artifact arrays merge as filename-keyed upserts, so deltas can land
//! in any order and duplicates collapse; scalar fields are
//! last-write-wins. Unknown fields pass through untouched.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// One produced file, keyed by filename. Remaining fields (url, subfolder,
/// type, ...) are machine-defined and passed through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub filename: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// The merged output record for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputData {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gifs: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    /// Opaque passthrough for fields this core does not model.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl OutputData {
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Nothing worth persisting.
    pub fn is_trivial(&self) -> bool {
        self.images.is_empty()
            && self.files.is_empty()
            && self.gifs.is_empty()
            && self.text.is_none()
            && self.error.is_none()
            && self.extra.is_empty()
    }

    /// Fold `delta` into this record. Artifacts upsert by filename with
    /// the delta winning on matching names; scalars are last-write-wins.
    pub fn merge(&mut self, delta: OutputData) {
        merge_artifacts(&mut self.images, delta.images);
        merge_artifacts(&mut self.files, delta.files);
        merge_artifacts(&mut self.gifs, delta.gifs);

        if delta.text.is_some() {
            self.text = delta.text;
        }
        if delta.error.is_some() {
            self.error = delta.error;
        }
        for (key, value) in delta.extra {
            self.extra.insert(key, value);
        }
    }
}

fn merge_artifacts(existing: &mut Vec<Artifact>, incoming: Vec<Artifact>) {
    for artifact in incoming {
        match existing.iter_mut().find(|a| a.filename == artifact.filename) {
            Some(slot) => *slot = artifact,
            None => existing.push(artifact),
        }
    }
}

/// Persisted output row. At most one canonical row per run survives a
/// merge; historical duplicates get folded in and deleted.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub id: Uuid,
    pub run_id: Uuid,
    #[sqlx(json)]
    pub data: OutputData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunOutput {
    /// Oldest first, so a left-fold keeps the earliest row canonical.
    pub async fn find_by_run(run_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        let outputs = sqlx::query_as::<_, RunOutput>(
            "SELECT * FROM run_outputs WHERE run_id = $1 ORDER BY created_at",
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?;
        Ok(outputs)
    }

    /// Replace all rows for the run with one canonical row.
    pub async fn save_canonical(run_id: Uuid, data: &OutputData, pool: &PgPool) -> Result<()> {
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM run_outputs WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO run_outputs (id, run_id, data, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(serde_json::to_value(data)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_by_run(run_id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query("DELETE FROM run_outputs WHERE run_id = $1")
            .bind(run_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn artifact(filename: &str, url: &str) -> Artifact {
        let mut fields = serde_json::Map::new();
        fields.insert("url".to_string(), json!(url));
        Artifact {
            filename: filename.to_string(),
            fields,
        }
    }

    fn with_images(images: Vec<Artifact>) -> OutputData {
        OutputData {
            images,
            ..Default::default()
        }
    }

    #[test]
    fn merge_upserts_by_filename() {
        let mut base = with_images(vec![artifact("a.png", "v1"), artifact("b.png", "v1")]);
        base.merge(with_images(vec![artifact("a.png", "v2"), artifact("c.png", "v1")]));

        assert_eq!(base.images.len(), 3);
        let a = base.images.iter().find(|a| a.filename == "a.png").unwrap();
        assert_eq!(a.fields["url"], json!("v2"));
    }

    #[test]
    fn merge_of_disjoint_deltas_commutes() {
        let delta_one = with_images(vec![artifact("a.png", "v1")]);
        let delta_two = with_images(vec![artifact("b.png", "v1")]);

        let mut left = OutputData::default();
        left.merge(delta_one.clone());
        left.merge(delta_two.clone());

        let mut right = OutputData::default();
        right.merge(delta_two);
        right.merge(delta_one);

        let normalize = |mut data: OutputData| {
            data.images.sort_by(|a, b| a.filename.cmp(&b.filename));
            data
        };
        assert_eq!(normalize(left), normalize(right));
    }

    #[test]
    fn scalar_fields_are_last_write_wins() {
        let mut base = OutputData {
            text: Some("first".to_string()),
            ..Default::default()
        };
        base.merge(OutputData {
            text: Some("second".to_string()),
            error: Some(json!({"error_type": "oom"})),
            ..Default::default()
        });

        assert_eq!(base.text.as_deref(), Some("second"));
        assert_eq!(base.error, Some(json!({"error_type": "oom"})));
    }

    #[test]
    fn merge_without_scalars_keeps_existing() {
        let mut base = OutputData {
            text: Some("kept".to_string()),
            ..Default::default()
        };
        base.merge(OutputData::default());
        assert_eq!(base.text.as_deref(), Some("kept"));
    }

    #[test]
    fn unknown_fields_round_trip() {
        let data = OutputData::from_value(json!({
            "images": [{"filename": "a.png", "url": "u"}],
            "node_errors": {"3": "bad"}
        }))
        .unwrap();

        assert_eq!(data.images.len(), 1);
        assert_eq!(data.extra["node_errors"], json!({"3": "bad"}));
        assert!(!data.is_trivial());

        let round = serde_json::to_value(&data).unwrap();
        assert_eq!(round["node_errors"], json!({"3": "bad"}));
    }

    #[test]
    fn empty_payload_is_trivial() {
        assert!(OutputData::from_value(json!({})).unwrap().is_trivial());
    }
}
