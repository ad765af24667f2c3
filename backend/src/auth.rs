// backend/src/auth.rs

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub user_id: String,
}

/// Issues throwaway identities. There is no per-record ownership: the id
/// only names a dashboard session.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuth;

impl AnonymousAuth {
    pub fn sign_in_anonymously(&self) -> Identity {
        Identity { user_id: Uuid::new_v4().to_string() }
    }
}
