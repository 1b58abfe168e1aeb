use serde::{Deserialize, Serialize};

use tessel_common::{KeyspaceIdType, TesselError, TesselResult};

/// A named sharded database: one sharding key definition shared by all its
/// shards. The column/type may start unset (legacy import) and is fixed via
/// `set_sharding_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keyspace {
    pub name: String,
    pub sharding_column: Option<String>,
    pub sharding_key_type: Option<KeyspaceIdType>,
}

impl Keyspace {
    pub fn new(
        name: impl Into<String>,
        sharding_column: Option<String>,
        sharding_key_type: Option<KeyspaceIdType>,
    ) -> Self {
        Self {
            name: name.into(),
            sharding_column,
            sharding_key_type,
        }
    }

    /// Fix or confirm the sharding key definition.
    ///
    /// Succeeds when the definition is not yet fixed, when it matches the
    /// existing value exactly (idempotent no-op), or when `force` is set.
    /// A mismatch without `force` is a `Config` error and changes nothing.
    pub fn set_sharding_info(
        &mut self,
        column: &str,
        key_type: KeyspaceIdType,
        force: bool,
    ) -> TesselResult<()> {
        let unset = self.sharding_column.is_none() && self.sharding_key_type.is_none();
        let matches = self.sharding_column.as_deref() == Some(column)
            && self.sharding_key_type == Some(key_type);
        if !unset && !matches && !force {
            return Err(TesselError::Config(format!(
                "keyspace {} already has sharding info {}/{}, use force to override",
                self.name,
                self.sharding_column.as_deref().unwrap_or("<unset>"),
                self.sharding_key_type
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "<unset>".into()),
            )));
        }
        self.sharding_column = Some(column.to_string());
        self.sharding_key_type = Some(key_type);
        Ok(())
    }
}
