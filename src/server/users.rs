//! The user table: HTTP Basic authentication against bcrypt hashes and
//! the optional anonymous principal.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::server::config::{Config, ConfigError};
use crate::server::storage::Storage;

/// An authenticated principal bound to its storage.
#[derive(Debug)]
pub struct User {
    pub name: String,
    secret_hash: String,
    pub storage: Arc<Storage>,
    pub read_only: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    BadHeader,
    UnknownUser,
    BadPassword,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::BadHeader => f.write_str("bad authorization header"),
            AuthError::UnknownUser => f.write_str("user not exists"),
            AuthError::BadPassword => f.write_str("password hash mismatch"),
        }
    }
}

impl std::error::Error for AuthError {}

pub struct UserTable {
    users: HashMap<String, Arc<User>>,
    anonymous: Option<Arc<User>>,
}

impl UserTable {
    /// Builds the table from configuration, resolving every storage root
    /// once. A read-only storage forces its users read-only.
    pub fn build(config: &Config) -> Result<Self, ConfigError> {
        let mut storages: HashMap<&str, Arc<Storage>> = HashMap::new();
        for st in &config.storages {
            if storages.contains_key(st.id.as_str()) {
                return Err(ConfigError::Invalid(match st.id.as_str() {
                    "" => "default storage repeated".to_owned(),
                    id => format!("storage id '{id}' repeated"),
                }));
            }
            let storage = Storage::new(Path::new(&st.path), st.read_only)
                .map_err(|err| ConfigError::Invalid(format!("storage '{}': {err}", st.id)))?;
            storages.insert(st.id.as_str(), Arc::new(storage));
        }

        let mut users = HashMap::new();
        for us in &config.users {
            if us.name.is_empty() {
                return Err(ConfigError::Invalid("username can not be empty".to_owned()));
            }
            if users.contains_key(&us.name) {
                return Err(ConfigError::Invalid(format!("user '{}' repeated", us.name)));
            }
            let Some(storage) = storages.get(us.storage.as_str()) else {
                return Err(ConfigError::Invalid(format!(
                    "user '{}' referenced a storage that does not exist",
                    us.name
                )));
            };
            let read_only = us.read_only || storage.read_only();
            users.insert(
                us.name.clone(),
                Arc::new(User {
                    name: us.name.clone(),
                    secret_hash: us.secret_hash.clone(),
                    storage: Arc::clone(storage),
                    read_only,
                }),
            );
        }

        let anonymous = if config.anonymous.enable {
            let Some(storage) = storages.get(config.anonymous.storage.as_str()) else {
                return Err(ConfigError::Invalid(
                    "anonymous user referenced a storage that does not exist".to_owned(),
                ));
            };
            let read_only = config.anonymous.read_only || storage.read_only();
            Some(Arc::new(User {
                name: String::new(),
                secret_hash: String::new(),
                storage: Arc::clone(storage),
                read_only,
            }))
        } else {
            None
        };

        Ok(Self { users, anonymous })
    }

    pub fn anonymous(&self) -> Option<Arc<User>> {
        self.anonymous.as_ref().map(Arc::clone)
    }

    /// Authenticates the value of an `Authorization: Basic` header.
    /// The bcrypt comparison runs on the blocking pool.
    pub async fn authenticate_basic(&self, header_value: &str) -> Result<Arc<User>, AuthError> {
        let (username, password) = parse_basic(header_value).ok_or(AuthError::BadHeader)?;
        let user = self.users.get(&username).ok_or(AuthError::UnknownUser)?;

        let hash = user.secret_hash.clone();
        let verified = tokio::task::spawn_blocking(move || bcrypt::verify(&password, &hash))
            .await
            .map_err(|_| AuthError::BadPassword)?;
        match verified {
            Ok(true) => Ok(Arc::clone(user)),
            _ => Err(AuthError::BadPassword),
        }
    }
}

fn parse_basic(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_owned(), password.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::config::{AnonymousConfig, StorageConfig, UserConfig};

    fn base_config(dir: &Path) -> Config {
        Config {
            storages: vec![StorageConfig {
                id: String::new(),
                path: dir.display().to_string(),
                read_only: false,
            }],
            ..Config::default()
        }
    }

    #[test]
    fn parse_basic_header() {
        // "alice:secret"
        assert_eq!(
            parse_basic("Basic YWxpY2U6c2VjcmV0"),
            Some(("alice".to_owned(), "secret".to_owned()))
        );
        assert_eq!(parse_basic("Bearer token"), None);
        assert_eq!(parse_basic("Basic !!!"), None);
    }

    #[tokio::test]
    async fn authenticates_against_bcrypt_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.users.push(UserConfig {
            name: "alice".to_owned(),
            secret_hash: bcrypt::hash("secret", 4).unwrap(),
            storage: String::new(),
            read_only: false,
        });
        let table = UserTable::build(&config).unwrap();

        let header = format!("Basic {}", BASE64.encode("alice:secret"));
        let user = table.authenticate_basic(&header).await.unwrap();
        assert_eq!(user.name, "alice");

        let wrong = format!("Basic {}", BASE64.encode("alice:wrong"));
        assert_eq!(table.authenticate_basic(&wrong).await.unwrap_err(), AuthError::BadPassword);

        let missing = format!("Basic {}", BASE64.encode("bob:secret"));
        assert_eq!(table.authenticate_basic(&missing).await.unwrap_err(), AuthError::UnknownUser);
    }

    #[test]
    fn read_only_storage_forces_read_only_users() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.storages[0].read_only = true;
        config.users.push(UserConfig {
            name: "alice".to_owned(),
            secret_hash: "x".to_owned(),
            storage: String::new(),
            read_only: false,
        });
        config.anonymous = AnonymousConfig { enable: true, storage: String::new(), read_only: false };
        let table = UserTable::build(&config).unwrap();
        assert!(table.users.get("alice").unwrap().read_only);
        assert!(table.anonymous().unwrap().read_only);
    }

    #[test]
    fn rejects_broken_references() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = base_config(dir.path());
        config.users.push(UserConfig {
            name: "alice".to_owned(),
            secret_hash: "x".to_owned(),
            storage: "missing".to_owned(),
            read_only: false,
        });
        assert!(UserTable::build(&config).is_err());

        let mut config = base_config(dir.path());
        config.anonymous.enable = true;
        config.anonymous.storage = "missing".to_owned();
        assert!(UserTable::build(&config).is_err());

        let mut config = base_config(dir.path());
        config.storages.push(config.storages[0].clone());
        assert!(UserTable::build(&config).is_err());
    }
}
