pub mod memory;
pub mod sql;
pub mod traits;

pub use memory::InMemoryStore;
pub use sql::SqliteStore;
pub use traits::{LocalStore, StoreError};

use std::collections::HashSet;

use crate::system::{self, JsonObject};

/// Column set of a defined table: the sample's keys plus the system fields.
pub(crate) fn table_columns(sample: &JsonObject) -> HashSet<String> {
    sample
        .keys()
        .cloned()
        .chain(
            [system::ID, system::VERSION, system::UPDATED_AT, system::DELETED]
                .into_iter()
                .map(String::from),
        )
        .collect()
}

/// Apply the column rules of a defined table to one row and extract its id.
pub(crate) fn conform_row(
    table: &str,
    columns: Option<&HashSet<String>>,
    item: &JsonObject,
    from_server: bool,
) -> Result<(String, JsonObject), StoreError> {
    let id = system::item_id(item)
        .ok_or_else(|| StoreError::MissingId(table.to_string()))?
        .to_string();

    let Some(columns) = columns else {
        return Ok((id, item.clone()));
    };

    if !from_server {
        if let Some(column) = item.keys().find(|k| !columns.contains(k.as_str())) {
            return Err(StoreError::UnknownColumn {
                table: table.to_string(),
                column: column.clone(),
            });
        }
        return Ok((id, item.clone()));
    }

    let row = item
        .iter()
        .filter(|(k, _)| columns.contains(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Ok((id, row))
}
