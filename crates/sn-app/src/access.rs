//! The verified-user gate every support entry point passes first.

use std::sync::Arc;

use anyhow::Result;

use sn_domain::{ChatUserId, User};
use sn_storage::UserRepository;

pub struct AccessGate {
    users: Arc<dyn UserRepository>,
}

impl AccessGate {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }

    /// An active user with a bound CPF. `None` means the caller must go
    /// through verification first.
    pub async fn verified_user(&self, user_id: ChatUserId) -> Result<Option<User>> {
        Ok(self
            .users
            .find_by_id(user_id)
            .await?
            .filter(|user| user.is_verified()))
    }
}
