//! Vet roster: who can be dispatched where, and how to reach them.

use crate::error::{DbError, Result};
use crate::types::*;
use crate::{parse_column, DispatchDb};
use sqlx::Row;
use vetdispatch_ids::CandidateId;

impl DispatchDb {
    /// Insert or replace a roster entry and its species coverage.
    pub async fn upsert_roster_entry(&self, entry: &RosterEntry) -> Result<()> {
        let city = entry.city.trim();
        if city.is_empty() {
            return Err(DbError::constraint(format!(
                "roster entry {} has no city",
                entry.candidate_id
            )));
        }

        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO vet_roster
                (candidate_id, display_name, email, phone, city, active, available, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(candidate_id) DO UPDATE SET
                display_name = excluded.display_name,
                email = excluded.email,
                phone = excluded.phone,
                city = excluded.city,
                active = excluded.active,
                available = excluded.available,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entry.candidate_id.as_str())
        .bind(entry.display_name.trim())
        .bind(entry.email.as_deref().map(str::trim))
        .bind(entry.phone.as_deref().map(str::trim))
        .bind(city)
        .bind(entry.active)
        .bind(entry.available)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM vet_roster_species WHERE candidate_id = ?")
            .bind(entry.candidate_id.as_str())
            .execute(&mut *tx)
            .await?;

        for species in normalized_species(&entry.species) {
            sqlx::query(
                "INSERT OR IGNORE INTO vet_roster_species (candidate_id, species) VALUES (?, ?)",
            )
            .bind(entry.candidate_id.as_str())
            .bind(species)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Active vets in `city` covering `species`, ordered by candidate id.
    ///
    /// Matching is case-insensitive on both city and species.
    pub async fn find_eligible_vets(
        &self,
        city: &str,
        species: &str,
        exclude_unavailable: bool,
    ) -> Result<Vec<CandidateId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT r.candidate_id FROM vet_roster r
            JOIN vet_roster_species s ON s.candidate_id = r.candidate_id
            WHERE lower(r.city) = lower(?)
              AND s.species = lower(?)
              AND r.active = 1
              AND (? = 0 OR r.available = 1)
            ORDER BY r.candidate_id ASC
            "#,
        )
        .bind(city.trim())
        .bind(species.trim())
        .bind(exclude_unavailable)
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|id| parse_column::<CandidateId>(id, "vet_roster.candidate_id"))
            .collect()
    }

    pub async fn get_roster_entry(&self, candidate_id: &CandidateId) -> Result<Option<RosterEntry>> {
        let row = sqlx::query("SELECT * FROM vet_roster WHERE candidate_id = ?")
            .bind(candidate_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let species: Vec<String> = sqlx::query_scalar(
            "SELECT species FROM vet_roster_species WHERE candidate_id = ? ORDER BY species",
        )
        .bind(candidate_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(RosterEntry {
            candidate_id: candidate_id.clone(),
            display_name: row.get("display_name"),
            email: row.get("email"),
            phone: row.get("phone"),
            city: row.get("city"),
            species,
            active: row.get::<i64, _>("active") != 0,
            available: row.get::<i64, _>("available") != 0,
        }))
    }

    /// Flip a vet's availability. Returns false for unknown vets.
    pub async fn set_availability(&self, candidate_id: &CandidateId, available: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE vet_roster SET available = ?, updated_at = ? WHERE candidate_id = ?")
                .bind(available)
                .bind(Self::now_millis())
                .bind(candidate_id.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn normalized_species(species: &[String]) -> Vec<String> {
    let mut out: Vec<String> = species
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
