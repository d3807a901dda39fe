// Credential store for client authentication

use crate::ipc::error::{IpcError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

/// Default PBKDF2 iteration count for new credentials
pub const DEFAULT_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Role assigned to an authenticated session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// A stored credential; the password itself is never kept
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Credential {
    salt: String,
    hash: String,
    iterations: u32,
    role: Role,
}

impl Credential {
    fn new(password: &str, role: Role, iterations: u32) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = hash_password(password, &salt, iterations);
        Self {
            salt: hex::encode(salt),
            hash: hex::encode(hash),
            iterations,
            role,
        }
    }

    fn matches(&self, password: &str) -> bool {
        let (Ok(salt), Ok(expected)) = (hex::decode(&self.salt), hex::decode(&self.hash)) else {
            return false;
        };
        let actual = hash_password(password, &salt, self.iterations);
        constant_time_eq(&actual, &expected)
    }
}

/// Maps user names to salted PBKDF2 password hashes and roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authenticator {
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default = "default_iterations")]
    iterations: u32,
    users: HashMap<String, Credential>,
}

fn default_active() -> bool {
    true
}

fn default_iterations() -> u32 {
    DEFAULT_ITERATIONS
}

impl Authenticator {
    /// Create an empty, active authenticator
    pub fn new() -> Self {
        Self::with_iterations(DEFAULT_ITERATIONS)
    }

    /// Create an authenticator hashing new passwords with `iterations` rounds
    pub fn with_iterations(iterations: u32) -> Self {
        Self {
            active: true,
            iterations: iterations.max(1),
            users: HashMap::new(),
        }
    }

    /// Whether authentication is enforced
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Add or replace a user
    pub fn add_credentials(&mut self, user: &str, password: &str, role: Role) -> Result<()> {
        if user.trim().is_empty() {
            return Err(IpcError::InvalidConfig("user name must not be blank".to_string()));
        }
        if password.is_empty() {
            return Err(IpcError::InvalidConfig("password must not be empty".to_string()));
        }
        self.users
            .insert(user.to_string(), Credential::new(password, role, self.iterations));
        Ok(())
    }

    /// Remove a user; returns whether it existed
    pub fn remove_credentials(&mut self, user: &str) -> bool {
        self.users.remove(user).is_some()
    }

    pub fn contains(&self, user: &str) -> bool {
        self.users.contains_key(user)
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Verify a user's password and return the role on success
    ///
    /// Hashes the password even for an unknown user so a miss takes as long
    /// as a wrong password. This is CPU bound; call it off the async runtime.
    pub fn authenticate(&self, user: &str, password: &str) -> Option<Role> {
        match self.users.get(user) {
            Some(credential) => credential.matches(password).then_some(credential.role),
            None => {
                std::hint::black_box(hash_password(password, &[0u8; SALT_LEN], self.iterations));
                None
            }
        }
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.users
            .get(user)
            .map(|c| c.role == Role::Admin)
            .unwrap_or(false)
    }

    /// Serialize the store to a writer
    pub fn write_to<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Deserialize a store from a reader
    pub fn read_from<R: Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    /// Save the store to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            self.write_to(&mut file)?;
            file.flush()?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load a store from a file
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::read_from(std::io::BufReader::new(file))
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_password(password: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
