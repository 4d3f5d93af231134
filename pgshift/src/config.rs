//! Pipeline configuration. Assembling these values (CLI, files, inventory
//! stores) is the caller's concern; validation happens here, before any
//! connection is opened.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::ValidationError;

/// Connection parts for one PostgreSQL instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConf {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub dbname: String,
}

impl EndpointConf {
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.dbname)
            .application_name("pgshift");
        if !self.password.is_empty() {
            config.password(&self.password);
        }
        config
    }

    fn validate(&self, side: &str) -> Result<(), ValidationError> {
        for (field, value) in [
            ("host", &self.host),
            ("user", &self.user),
            ("dbname", &self.dbname),
        ] {
            if value.is_empty() {
                return Err(ValidationError(format!("{side}.{field} must be set")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgShiftConf {
    pub source: EndpointConf,
    pub dest: EndpointConf,
    /// Name of the logical replication slot on the source.
    pub slot_name: String,
    /// Publication consumed by the slot; created `FOR ALL TABLES` if absent.
    pub publication: String,
    pub output_plugin: String,
    /// Changes carrying this origin tag are dropped before the applier.
    /// Empty disables filtering.
    pub origin_id: String,
    /// Origin tag bound to destination sessions so a paired reverse pipeline
    /// can recognize (and drop) our writes. Empty disables origin setup.
    pub apply_origin: String,
    /// Parallel snapshot copy workers, minimum 1.
    pub snapshot_workers: usize,
    /// Cadence of standby status updates to the source.
    pub status_interval: Duration,
    pub connect_timeout: Duration,
}

impl PgShiftConf {
    pub fn new(source: EndpointConf, dest: EndpointConf) -> Self {
        PgShiftConf {
            source,
            dest,
            slot_name: defaults::DEFAULT_SLOT_NAME.to_string(),
            publication: defaults::DEFAULT_PUBLICATION.to_string(),
            output_plugin: defaults::DEFAULT_OUTPUT_PLUGIN.to_string(),
            origin_id: String::new(),
            apply_origin: String::new(),
            snapshot_workers: defaults::DEFAULT_SNAPSHOT_WORKERS,
            status_interval: defaults::DEFAULT_STATUS_INTERVAL,
            connect_timeout: defaults::DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.source.validate("source")?;
        self.dest.validate("dest")?;
        for (field, value) in [
            ("slot_name", &self.slot_name),
            ("publication", &self.publication),
            ("output_plugin", &self.output_plugin),
        ] {
            if value.is_empty() {
                return Err(ValidationError(format!("replication.{field} must be set")));
            }
        }
        if self.snapshot_workers < 1 {
            return Err(ValidationError(
                "snapshot.workers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn dummy() -> Self {
        let endpoint = |dbname: &str| EndpointConf {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            dbname: dbname.to_string(),
        };
        PgShiftConf::new(endpoint("src"), endpoint("dst"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_conf_is_valid() {
        assert!(PgShiftConf::dummy().validate().is_ok());
    }

    #[test]
    fn rejects_missing_host() {
        let mut conf = PgShiftConf::dummy();
        conf.source.host.clear();
        let err = conf.validate().unwrap_err();
        assert!(err.to_string().contains("source.host"));
    }

    #[test]
    fn rejects_zero_workers() {
        let mut conf = PgShiftConf::dummy();
        conf.snapshot_workers = 0;
        assert!(conf.validate().is_err());
    }

    #[test]
    fn rejects_empty_slot_name() {
        let mut conf = PgShiftConf::dummy();
        conf.slot_name.clear();
        assert!(conf.validate().is_err());
    }
}
