use mailbridge_shared::types::UserId;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::PuppetRecord;
use crate::users::parse_user_id;

const PUPPET_COLUMNS: &str = "email_address, display_name, name_set, custom_mxid, access_token";

impl Database {
    pub fn insert_puppet(&self, puppet: &PuppetRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO puppets (email_address, display_name, name_set, custom_mxid, access_token)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                puppet.email_address,
                puppet.display_name,
                puppet.name_set,
                puppet.custom_mxid.as_ref().map(UserId::as_str),
                puppet.access_token,
            ],
        )?;
        Ok(())
    }

    pub fn update_puppet(&self, puppet: &PuppetRecord) -> Result<()> {
        self.conn().execute(
            "UPDATE puppets
             SET display_name = ?2, name_set = ?3, custom_mxid = ?4, access_token = ?5
             WHERE email_address = ?1",
            params![
                puppet.email_address,
                puppet.display_name,
                puppet.name_set,
                puppet.custom_mxid.as_ref().map(UserId::as_str),
                puppet.access_token,
            ],
        )?;
        Ok(())
    }

    pub fn get_puppet_by_address(&self, address: &str) -> Result<Option<PuppetRecord>> {
        let puppet = self
            .conn()
            .query_row(
                &format!("SELECT {PUPPET_COLUMNS} FROM puppets WHERE email_address = ?1"),
                params![address],
                row_to_puppet,
            )
            .optional()?;
        Ok(puppet)
    }

    pub fn get_puppet_by_custom_mxid(&self, mxid: &UserId) -> Result<Option<PuppetRecord>> {
        let puppet = self
            .conn()
            .query_row(
                &format!("SELECT {PUPPET_COLUMNS} FROM puppets WHERE custom_mxid = ?1"),
                params![mxid.as_str()],
                row_to_puppet,
            )
            .optional()?;
        Ok(puppet)
    }

    /// Puppets linked to a local user (double puppets).
    pub fn get_puppets_with_custom_mxid(&self) -> Result<Vec<PuppetRecord>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PUPPET_COLUMNS} FROM puppets WHERE custom_mxid IS NOT NULL ORDER BY email_address"
        ))?;
        let rows = stmt.query_map([], row_to_puppet)?;

        let mut puppets = Vec::new();
        for row in rows {
            puppets.push(row?);
        }
        Ok(puppets)
    }
}

fn row_to_puppet(row: &rusqlite::Row<'_>) -> rusqlite::Result<PuppetRecord> {
    let custom_mxid: Option<String> = row.get(3)?;
    Ok(PuppetRecord {
        email_address: row.get(0)?,
        display_name: row.get(1)?,
        name_set: row.get(2)?,
        custom_mxid: custom_mxid.map(|s| parse_user_id(3, &s)).transpose()?,
        access_token: row.get(4)?,
    })
}
