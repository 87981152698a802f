//! Charging clients for fulfilled requests.

use std::collections::HashMap;
use std::sync::Mutex;
use log::{debug, warn};
use crate::server::context::RequestContext;
use crate::server::worker::{props, WorkerConfig};

/// Property prefix for the per-user balances of [`Accounter::Balance`].
pub const ACCOUNT_PREFIX: &str = "ACCOUNT.";


//------------ Accounter -----------------------------------------------------

#[derive(Debug)]
pub enum Accounter {
    /// Grants every purchase without keeping track.
    NoCharge,

    /// Charges one credit per request from the balance of the user.
    Balance(Mutex<HashMap<String, u64>>),
}

impl Accounter {
    /// Creates the accounter for a worker from its `ACCOUNTER` property.
    ///
    /// Problems are added to the list of configuration errors.
    pub fn from_properties(
        config: &WorkerConfig, errors: &mut Vec<String>
    ) -> Self {
        match config.get_non_empty(props::ACCOUNTER) {
            None => Accounter::NoCharge,
            Some(kind) if kind.eq_ignore_ascii_case("NOCHARGE") => {
                Accounter::NoCharge
            }
            Some(kind) if kind.eq_ignore_ascii_case("BALANCE") => {
                let mut balances = HashMap::new();
                for (user, value) in config.with_prefix(ACCOUNT_PREFIX) {
                    match value.trim().parse::<u64>() {
                        Ok(credits) => {
                            balances.insert(user.to_uppercase(), credits);
                        }
                        Err(_) => errors.push(format!(
                            "Illegal balance for {ACCOUNT_PREFIX}{user}: {value}"
                        ))
                    }
                }
                Accounter::Balance(Mutex::new(balances))
            }
            Some(kind) => {
                errors.push(format!("Unsupported ACCOUNTER: {kind}"));
                Accounter::NoCharge
            }
        }
    }

    /// Charges the client of the request.
    ///
    /// Returns whether the purchase was granted.
    pub fn purchase(&self, context: &RequestContext) -> bool {
        match self {
            Accounter::NoCharge => true,
            Accounter::Balance(balances) => {
                let user = match context.credentials() {
                    Some(credentials) => credentials.username.to_uppercase(),
                    None => {
                        debug!("No username to charge");
                        return false
                    }
                };
                let mut balances = balances.lock().unwrap();
                match balances.get_mut(&user) {
                    Some(credits) if *credits > 0 => {
                        *credits -= 1;
                        true
                    }
                    _ => {
                        warn!("No credits left for user {user}");
                        false
                    }
                }
            }
        }
    }

    /// Returns the balance of a user, if balances are kept.
    pub fn balance(&self, username: &str) -> Option<u64> {
        match self {
            Accounter::NoCharge => None,
            Accounter::Balance(balances) => {
                balances.lock().unwrap()
                    .get(&username.to_uppercase()).copied()
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------
