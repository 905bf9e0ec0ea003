// Model metadata repository
// Handles CRUD operations for known models and the "chosen" flag

use anyhow::{Context, Result};
use rusqlite::{params, Connection, Row};

use super::models::ModelRow;
use super::DatabaseManager;
use crate::llm_engine::ModelDescriptor;

const MODEL_COLUMNS: &str =
    "id, origin, name, display_name, local_path, is_chosen, created_at, updated_at";

impl DatabaseManager {
    /// All known models, oldest first
    pub fn list_models(&self) -> Result<Vec<ModelDescriptor>> {
        self.with_connection(list_models_impl)
    }

    /// Insert or update a model. Returns its row id.
    ///
    /// Saved descriptors update their own row; unsaved ones match on
    /// origin and name so re-downloading a model keeps its id.
    pub fn upsert_model(&self, descriptor: &ModelDescriptor) -> Result<i64> {
        self.with_connection(|conn| upsert_model_impl(conn, descriptor))
    }

    /// Delete a model row. Deleting an unknown model is not an error.
    pub fn delete_model(&self, descriptor: &ModelDescriptor) -> Result<()> {
        self.with_connection(|conn| delete_model_impl(conn, descriptor))
    }

    /// Clear the chosen flag on every model
    pub fn clear_chosen_flag(&self) -> Result<()> {
        self.with_connection(clear_chosen_flag_impl)
    }

    /// Most recently chosen model, if any
    pub fn get_last_chosen(&self) -> Result<Option<ModelDescriptor>> {
        self.with_connection(get_last_chosen_impl)
    }
}

fn row_to_model(row: &Row) -> rusqlite::Result<ModelRow> {
    Ok(ModelRow {
        id: row.get(0)?,
        origin: row.get(1)?,
        name: row.get(2)?,
        display_name: row.get(3)?,
        local_path: row.get(4)?,
        is_chosen: row.get::<_, i32>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn to_descriptor(row: ModelRow) -> Option<ModelDescriptor> {
    let descriptor = row.to_descriptor();
    if descriptor.is_none() {
        log::warn!("Skipping model {} with unknown origin {:?}", row.id, row.origin);
    }
    descriptor
}

fn list_models_impl(conn: &Connection) -> Result<Vec<ModelDescriptor>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM model ORDER BY id",
        MODEL_COLUMNS
    )).context("Failed to prepare list_models query")?;

    let rows = stmt.query_map([], row_to_model)
        .context("Failed to query models")?;

    let mut models = Vec::new();
    for row in rows {
        let row = row.context("Failed to read model row")?;
        if let Some(descriptor) = to_descriptor(row) {
            models.push(descriptor);
        }
    }

    Ok(models)
}

fn upsert_model_impl(conn: &Connection, descriptor: &ModelDescriptor) -> Result<i64> {
    let local_path = descriptor
        .local_path
        .as_ref()
        .map(|p| p.to_string_lossy().to_string());
    let is_chosen = if descriptor.is_chosen { 1 } else { 0 };

    if descriptor.id != ModelDescriptor::UNSAVED_ID {
        let updated = conn.execute(
            r#"
            UPDATE model SET
                origin = ?2,
                name = ?3,
                display_name = ?4,
                local_path = ?5,
                is_chosen = ?6,
                updated_at = datetime('now')
            WHERE id = ?1
            "#,
            params![
                descriptor.id,
                descriptor.origin.as_str(),
                descriptor.name,
                descriptor.display_name,
                local_path,
                is_chosen,
            ],
        ).context("Failed to update model")?;

        if updated > 0 {
            return Ok(descriptor.id);
        }
        // Row was deleted in the meantime, insert it again
    }

    let id = conn.query_row(
        r#"
        INSERT INTO model (origin, name, display_name, local_path, is_chosen, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, datetime('now'), datetime('now'))
        ON CONFLICT(origin, name) DO UPDATE SET
            display_name = excluded.display_name,
            local_path = excluded.local_path,
            is_chosen = excluded.is_chosen,
            updated_at = datetime('now')
        RETURNING id
        "#,
        params![
            descriptor.origin.as_str(),
            descriptor.name,
            descriptor.display_name,
            local_path,
            is_chosen,
        ],
        |row| row.get(0),
    ).context("Failed to insert model")?;

    Ok(id)
}

fn delete_model_impl(conn: &Connection, descriptor: &ModelDescriptor) -> Result<()> {
    if descriptor.id != ModelDescriptor::UNSAVED_ID {
        conn.execute("DELETE FROM model WHERE id = ?", params![descriptor.id])
            .context("Failed to delete model")?;
    } else {
        conn.execute(
            "DELETE FROM model WHERE origin = ?1 AND name = ?2",
            params![descriptor.origin.as_str(), descriptor.name],
        ).context("Failed to delete model")?;
    }

    Ok(())
}

fn clear_chosen_flag_impl(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE model SET is_chosen = 0, updated_at = datetime('now') WHERE is_chosen = 1",
        [],
    ).context("Failed to clear chosen flag")?;

    Ok(())
}

fn get_last_chosen_impl(conn: &Connection) -> Result<Option<ModelDescriptor>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM model WHERE is_chosen = 1 ORDER BY updated_at DESC, id DESC LIMIT 1",
        MODEL_COLUMNS
    )).context("Failed to prepare get_last_chosen query")?;

    let result = stmt.query_row([], row_to_model);

    match result {
        Ok(row) => Ok(to_descriptor(row)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e).context("Failed to get last chosen model"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn open() -> (TempDir, DatabaseManager) {
        let dir = tempdir().unwrap();
        let db = DatabaseManager::new(dir.path().join("models.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_upsert_assigns_and_keeps_id() {
        let (_dir, db) = open();

        let model = ModelDescriptor::downloadable("gemma-2b.bin");
        let id = db.upsert_model(&model).unwrap();
        assert!(id > 0);

        // Same origin and name without an id maps to the same row
        let again = db.upsert_model(&model.clone().with_display_name("Gemma")).unwrap();
        assert_eq!(again, id);

        let models = db.list_models().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, id);
        assert_eq!(models[0].display_name, "Gemma");
    }

    #[test]
    fn test_upsert_by_id_updates_path() {
        let (_dir, db) = open();

        let mut model = ModelDescriptor::downloadable("phi.bin");
        model.id = db.upsert_model(&model).unwrap();
        model.local_path = Some("/data/models/phi.bin".into());
        assert_eq!(db.upsert_model(&model).unwrap(), model.id);

        let stored = db.list_models().unwrap().remove(0);
        assert_eq!(stored, model);
    }

    #[test]
    fn test_chosen_flag_round_trip() {
        let (_dir, db) = open();
        assert_eq!(db.get_last_chosen().unwrap(), None);

        let a = ModelDescriptor::on_device("a.bin", "/m/a.bin");
        let b = ModelDescriptor::hosted("openai/gpt-4o-mini");
        db.upsert_model(&a).unwrap();

        db.clear_chosen_flag().unwrap();
        db.upsert_model(&ModelDescriptor { is_chosen: true, ..a.clone() }).unwrap();
        assert_eq!(db.get_last_chosen().unwrap().unwrap().name, "a.bin");

        db.clear_chosen_flag().unwrap();
        let b_id = db.upsert_model(&ModelDescriptor { is_chosen: true, ..b }).unwrap();
        let chosen = db.get_last_chosen().unwrap().unwrap();
        assert_eq!(chosen.id, b_id);
        assert!(chosen.is_chosen);

        let flagged = db.list_models().unwrap().iter().filter(|m| m.is_chosen).count();
        assert_eq!(flagged, 1);
    }

    #[test]
    fn test_delete_model() {
        let (_dir, db) = open();

        let mut a = ModelDescriptor::on_device("a.bin", "/m/a.bin");
        a.id = db.upsert_model(&a).unwrap();
        let b = ModelDescriptor::downloadable("b.bin");
        db.upsert_model(&b).unwrap();

        db.delete_model(&a).unwrap();
        db.delete_model(&b).unwrap();
        db.delete_model(&b).unwrap();
        assert!(db.list_models().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_origin_rows_are_skipped() {
        let (_dir, db) = open();
        db.upsert_model(&ModelDescriptor::downloadable("ok.bin")).unwrap();
        db.with_connection(|conn| {
            conn.execute(
                "INSERT INTO model (origin, name, display_name) VALUES ('cloud', 'x', 'x')",
                [],
            )?;
            Ok(())
        }).unwrap();

        let models = db.list_models().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].name, "ok.bin");
    }
}
