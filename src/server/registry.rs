//! The registry of configured workers.
//!
//! Each worker has a staged configuration that can be changed at any time
//! and an active state that was created from it. Changes only become
//! active through [`WorkerRegistry::reload`], which swaps in a freshly
//! initialized state. Requests hold on to the state they started with.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use log::{debug, info, warn};
use serde::Serialize;
use crate::commons::crypto::token::{
    CryptoToken, InstanceCache, TokenError, TokenStatus
};
use crate::commons::error::Error;
use crate::server::accounter::Accounter;
use crate::server::auth::Authorizer;
use crate::server::signers::Processable;
use crate::server::stats::{Statistics, StatisticsSnapshot};
use crate::server::worker::{props, WorkerConfig, WorkerIdentifier, WorkerType};
use crate::server::worklog::WorkerLogger;


/// How often a reload is retried when it races with another reload.
const MAX_RELOAD_ATTEMPTS: usize = 4;


//------------ WorkerState ---------------------------------------------------

/// The active, immutable state of a worker.
#[derive(Debug)]
pub struct WorkerState {
    id: u32,
    name: String,
    worker_type: WorkerType,
    generation: u64,
    config: WorkerConfig,
    processable: Processable,
    token: Option<CryptoToken>,
    authorizer: Authorizer,
    logger: WorkerLogger,
    accounter: Accounter,
    config_errors: Vec<String>,
    cache: InstanceCache,
    stats: Arc<Statistics>,
}

impl WorkerState {
    fn init(
        id: u32,
        name: &str,
        worker_type: WorkerType,
        config: WorkerConfig,
        generation: u64,
        stats: Arc<Statistics>,
        libraries: &HashMap<String, PathBuf>,
    ) -> Self {
        let mut errors = Vec::new();
        let processable = Processable::init(worker_type, &config, &mut errors);
        let authorizer = Authorizer::from_properties(id, &config, &mut errors);
        let logger = WorkerLogger::from_properties(&config, &mut errors);
        let accounter = Accounter::from_properties(&config, &mut errors);

        let token = if processable.uses_crypto_token() {
            match CryptoToken::from_properties(&config, libraries) {
                Ok(Some(token)) => {
                    if token.default_key().is_none() {
                        errors.push(format!(
                            "Missing {} property", props::DEFAULTKEY
                        ));
                    }
                    Some(token)
                }
                Ok(None) => {
                    errors.push(format!(
                        "Missing {} property", props::CRYPTOTOKEN
                    ));
                    None
                }
                Err(TokenError::Initialization(list)) => {
                    errors.extend(list);
                    None
                }
                Err(err) => {
                    errors.push(err.to_string());
                    None
                }
            }
        }
        else {
            None
        };

        if let Some(value) = config.get_non_empty(props::MINREMAININGCERTVALIDITY) {
            if value.trim().parse::<u32>().is_err() {
                errors.push(format!(
                    "Illegal value for {}: {value}",
                    props::MINREMAININGCERTVALIDITY
                ));
            }
        }
        for key in [props::CHECKCERTVALIDITY, props::CHECKCERTPRIVATEKEYVALIDITY] {
            if let Err(err) = config.get_bool(key, false) {
                errors.push(err);
            }
        }

        if let Some(Err(err)) = token.as_ref().and_then(|t| t.auto_activate()) {
            warn!("Auto-activation of crypto token for worker {id} failed: {err}");
        }

        WorkerState {
            id,
            name: name.to_string(),
            worker_type,
            generation,
            config,
            processable,
            token,
            authorizer,
            logger,
            accounter,
            config_errors: errors,
            cache: InstanceCache::default(),
            stats,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    /// Returns how many times the worker has been reloaded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn processable(&self) -> &Processable {
        &self.processable
    }

    pub fn token(&self) -> Option<&CryptoToken> {
        self.token.as_ref()
    }

    pub fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    pub fn logger(&self) -> &WorkerLogger {
        &self.logger
    }

    pub fn accounter(&self) -> &Accounter {
        &self.accounter
    }

    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    pub fn stats(&self) -> &Statistics {
        &self.stats
    }

    /// Returns the problems found when the worker was initialized.
    pub fn config_errors(&self) -> &[String] {
        &self.config_errors
    }

    pub fn is_disabled(&self) -> bool {
        self.config.is_true(props::DISABLED)
    }

    /// Returns everything that currently prevents the worker from working.
    ///
    /// Besides the configuration errors this checks the crypto token and
    /// the signer certificate.
    pub fn fatal_errors(&self) -> Vec<String> {
        let mut res = self.config_errors.clone();
        res.extend(self.processable.live_errors());
        if let Some(token) = self.token.as_ref() {
            if !token.is_active() {
                res.push("Crypto token is offline".into());
            }
            else if let Some(alias) = token.default_key() {
                match token.acquire(alias, None) {
                    Ok(instance) => {
                        res.extend(
                            self.processable.certificate_errors(instance.chain())
                        );
                        token.release(instance);
                    }
                    Err(err) => res.push(format!("Key not available: {err}")),
                }
            }
        }
        res
    }

    pub fn token_status(&self) -> Option<TokenStatus> {
        self.token.as_ref().map(|token| {
            token.status(token.default_key().as_slice())
        })
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            id: self.id,
            name: self.name.clone(),
            worker_type: self.worker_type,
            generation: self.generation,
            disabled: self.is_disabled(),
            token_status: self.token_status(),
            fatal_errors: self.fatal_errors(),
            statistics: self.stats.snapshot(),
        }
    }
}


//------------ WorkerStatus --------------------------------------------------

/// A report on the state of a worker.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerStatus {
    pub id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub worker_type: WorkerType,
    pub generation: u64,
    pub disabled: bool,
    pub token_status: Option<TokenStatus>,
    pub fatal_errors: Vec<String>,
    pub statistics: StatisticsSnapshot,
}


//------------ WorkerRegistry ------------------------------------------------

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    /// PKCS#11 libraries by name.
    libraries: HashMap<String, PathBuf>,

    workers: RwLock<HashMap<u32, WorkerEntry>>,
}

#[derive(Debug)]
struct WorkerEntry {
    staged: WorkerConfig,
    active: Arc<WorkerState>,
}

impl WorkerRegistry {
    pub fn new(libraries: HashMap<String, PathBuf>) -> Self {
        WorkerRegistry { libraries, workers: Default::default() }
    }

    /// Adds a worker and initializes it.
    ///
    /// Configuration problems do not prevent adding, they are reported as
    /// fatal errors of the worker.
    pub fn add_worker(
        &self,
        id: u32,
        name: &str,
        worker_type: WorkerType,
        config: WorkerConfig,
    ) -> Result<Arc<WorkerState>, Error> {
        Self::check_unique(&self.workers.read().unwrap(), id, name)?;
        let state = Arc::new(WorkerState::init(
            id, name, worker_type, config.clone(), 0,
            Arc::default(), &self.libraries
        ));

        let mut workers = self.workers.write().unwrap();
        Self::check_unique(&workers, id, name)?;
        info!(
            "Added {} worker {} ({}) with {} configuration errors",
            worker_type, id, name, state.config_errors.len()
        );
        workers.insert(id, WorkerEntry { staged: config, active: state.clone() });
        Ok(state)
    }

    fn check_unique(
        workers: &HashMap<u32, WorkerEntry>, id: u32, name: &str
    ) -> Result<(), Error> {
        if workers.contains_key(&id) {
            return Err(Error::signserver(format!(
                "Worker with id {id} already exists"
            )))
        }
        if workers.values().any(|w| w.active.name.eq_ignore_ascii_case(name)) {
            return Err(Error::signserver(format!(
                "Worker with name {name} already exists"
            )))
        }
        Ok(())
    }

    /// Returns the active state of a worker.
    ///
    /// Names are matched ignoring case.
    pub fn get(&self, worker: &WorkerIdentifier) -> Result<Arc<WorkerState>, Error> {
        let workers = self.workers.read().unwrap();
        let entry = match worker {
            WorkerIdentifier::Id(id) => workers.get(id),
            WorkerIdentifier::Name(name) => workers.values().find(|entry| {
                entry.active.name.eq_ignore_ascii_case(name)
            }),
        };
        entry.map(|entry| entry.active.clone())
            .ok_or_else(|| Error::NoSuchWorker(worker.clone()))
    }

    /// Returns the ids of all workers in ascending order.
    pub fn worker_ids(&self) -> Vec<u32> {
        let mut res: Vec<_> = self.workers.read().unwrap().keys().copied().collect();
        res.sort_unstable();
        res
    }

    /// Returns the staged configuration of a worker.
    pub fn staged_config(
        &self, worker: &WorkerIdentifier
    ) -> Result<WorkerConfig, Error> {
        let id = self.get(worker)?.id;
        self.with_entry(id, |entry| entry.staged.clone())
    }

    /// Sets a property in the staged configuration.
    pub fn set_property(
        &self, worker: &WorkerIdentifier, key: &str, value: &str
    ) -> Result<(), Error> {
        let id = self.get(worker)?.id;
        self.with_entry(id, |entry| entry.staged.set(key, value))
    }

    /// Removes a property from the staged configuration.
    ///
    /// Returns whether the property was present.
    pub fn remove_property(
        &self, worker: &WorkerIdentifier, key: &str
    ) -> Result<bool, Error> {
        let id = self.get(worker)?.id;
        self.with_entry(id, |entry| entry.staged.remove(key).is_some())
    }

    /// Makes the staged configuration active.
    ///
    /// The new state gets a new crypto token and an empty instance cache,
    /// the statistics are kept. The state is initialized without holding
    /// the registry lock. If another reload of the same worker finished in
    /// the meantime, this starts over with the current staged config.
    pub fn reload(
        &self, worker: &WorkerIdentifier
    ) -> Result<Arc<WorkerState>, Error> {
        let id = self.get(worker)?.id;
        for _ in 0..MAX_RELOAD_ATTEMPTS {
            let (staged, old) = self.with_entry(id, |entry| {
                (entry.staged.clone(), entry.active.clone())
            })?;
            let state = Arc::new(WorkerState::init(
                id, &old.name, old.worker_type, staged,
                old.generation + 1, old.stats.clone(), &self.libraries
            ));

            let mut workers = self.workers.write().unwrap();
            let entry = workers.get_mut(&id).ok_or_else(|| {
                Error::NoSuchWorker(worker.clone())
            })?;
            if entry.active.generation != old.generation {
                debug!("Worker {id} was reloaded concurrently, retrying");
                continue
            }
            info!(
                "Reloaded worker {} ({}), now at generation {}",
                id, state.name, state.generation
            );
            entry.active = state.clone();
            return Ok(state)
        }
        Err(Error::signserver(format!(
            "Worker {id} is being reloaded concurrently"
        )))
    }

    /// Activates the crypto token of a worker.
    pub fn activate(
        &self, worker: &WorkerIdentifier, auth_code: &str
    ) -> Result<(), Error> {
        let state = self.get(worker)?;
        let token = state.token().ok_or_else(|| {
            Error::illegal_request(format!(
                "Worker {} has no crypto token", state.id
            ))
        })?;
        token.activate(auth_code)?;
        info!("Activated crypto token of worker {}", state.id);
        Ok(())
    }

    /// Deactivates the crypto token of a worker.
    pub fn deactivate(&self, worker: &WorkerIdentifier) -> Result<(), Error> {
        let state = self.get(worker)?;
        let token = state.token().ok_or_else(|| {
            Error::illegal_request(format!(
                "Worker {} has no crypto token", state.id
            ))
        })?;
        token.deactivate();
        state.cache().clear();
        info!("Deactivated crypto token of worker {}", state.id);
        Ok(())
    }

    pub fn status(&self, worker: &WorkerIdentifier) -> Result<WorkerStatus, Error> {
        self.get(worker).map(|state| state.status())
    }

    fn with_entry<F, T>(&self, id: u32, op: F) -> Result<T, Error>
    where F: FnOnce(&mut WorkerEntry) -> T {
        let mut workers = self.workers.write().unwrap();
        workers.get_mut(&id).map(op).ok_or_else(|| {
            Error::NoSuchWorker(WorkerIdentifier::Id(id))
        })
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::token::keystore;
    use crate::test;

    fn timestamp_config(dir: &std::path::Path) -> WorkerConfig {
        [
            ("CRYPTOTOKEN", "KEYSTORE"),
            ("KEYSTOREPATH", dir.to_str().unwrap()),
            ("KEYSTOREPASSWORD", "foo123"),
            ("DEFAULTKEY", "ts"),
            ("DEFAULTTSAPOLICYOID", "1.2.3"),
            ("AUTHTYPE", "NOAUTH"),
        ].into_iter().collect()
    }

    #[test]
    fn add_and_resolve() {
        let dir = test::tmp_dir();
        let (key, cert) = test::tsa_key_and_cert("CN=TSA");
        keystore::write_entry(dir.path(), "ts", &key, &[cert], "foo123").unwrap();

        let registry = WorkerRegistry::default();
        registry.add_worker(
            1, "TimeStampSigner", WorkerType::Timestamp,
            timestamp_config(dir.path())
        ).unwrap();

        let by_name = registry.get(&"timestampsigner".into()).unwrap();
        assert_eq!(by_name.id(), 1);
        assert!(by_name.fatal_errors().is_empty(), "{:?}", by_name.fatal_errors());
        assert_eq!(by_name.token_status(), Some(TokenStatus::Active));

        assert_eq!(
            registry.get(&WorkerIdentifier::Id(2)).unwrap_err(),
            Error::NoSuchWorker(WorkerIdentifier::Id(2))
        );
        assert!(registry.add_worker(
            1, "Other", WorkerType::Cms, WorkerConfig::new()
        ).is_err());
    }

    #[test]
    fn changes_need_reload() {
        let dir = test::tmp_dir();
        let (key, cert) = test::tsa_key_and_cert("CN=TSA");
        keystore::write_entry(dir.path(), "ts", &key, &[cert], "foo123").unwrap();

        let registry = WorkerRegistry::default();
        let before = registry.add_worker(
            1, "TSA", WorkerType::Timestamp, timestamp_config(dir.path())
        ).unwrap();

        let id = WorkerIdentifier::Id(1);
        registry.set_property(&id, "DISABLED", "TRUE").unwrap();
        assert!(!registry.get(&id).unwrap().is_disabled());
        assert_eq!(registry.staged_config(&id).unwrap().get("DISABLED"), Some("TRUE"));

        let after = registry.reload(&id).unwrap();
        assert!(after.is_disabled());
        assert_eq!(after.generation(), 1);
        assert!(!before.is_disabled());

        assert!(registry.remove_property(&id, "disabled").unwrap());
        assert!(!registry.remove_property(&id, "disabled").unwrap());
        assert!(!registry.reload(&id).unwrap().is_disabled());
    }

    #[test]
    fn configuration_errors_are_collected() {
        let registry = WorkerRegistry::default();
        let state = registry.add_worker(
            5, "Broken", WorkerType::Timestamp,
            [("AUTHTYPE", "SOMETHING")].into_iter().collect()
        ).unwrap();
        let errors = state.fatal_errors();
        assert!(errors.contains(&"Unsupported AUTHTYPE: SOMETHING".to_string()));
        assert!(errors.contains(&"Missing CRYPTOTOKEN property".to_string()));
        assert!(errors.contains(
            &"No default TSA policy OID has been configured".to_string()
        ));
    }

    #[test]
    fn deactivated_token_is_a_fatal_error() {
        let dir = test::tmp_dir();
        let (key, cert) = test::tsa_key_and_cert("CN=TSA");
        keystore::write_entry(dir.path(), "ts", &key, &[cert], "foo123").unwrap();
        let registry = WorkerRegistry::default();
        registry.add_worker(
            1, "TSA", WorkerType::Timestamp, timestamp_config(dir.path())
        ).unwrap();

        let id = WorkerIdentifier::Id(1);
        registry.deactivate(&id).unwrap();
        let status = registry.status(&id).unwrap();
        assert_eq!(status.token_status, Some(TokenStatus::Offline));
        assert_eq!(status.fatal_errors, ["Crypto token is offline"]);

        registry.activate(&id, "foo123").unwrap();
        assert!(registry.status(&id).unwrap().fatal_errors.is_empty());
    }
}
