use chrono::{DateTime, Duration, Utc};

use crate::cpf::Cpf;
use crate::user::ChatUserId;

/// Single-use group invite issued to a verified subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupInvite {
    pub invite_id: Option<i64>,
    pub user_id: ChatUserId,
    pub cpf: Cpf,
    pub invite_url: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub client_name: Option<String>,
    pub plan_name: Option<String>,
}

impl GroupInvite {
    pub fn create(
        user_id: ChatUserId,
        cpf: Cpf,
        invite_url: String,
        client_name: Option<String>,
        plan_name: Option<String>,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            invite_id: None,
            user_id,
            cpf,
            invite_url,
            created_at: now,
            expires_at: now + duration,
            used: false,
            used_at: None,
            client_name,
            plan_name,
        }
    }

    pub fn mark_used(&mut self, now: DateTime<Utc>) {
        self.used = true;
        self.used_at = Some(now);
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.used && !self.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite(now: DateTime<Utc>) -> GroupInvite {
        GroupInvite::create(
            ChatUserId(7001),
            Cpf::parse("11144477735").unwrap(),
            "https://chat.example/join/abc".into(),
            Some("Alice".into()),
            Some("Gamer 500".into()),
            Duration::minutes(30),
            now,
        )
    }

    #[test]
    fn fresh_invite_is_valid() {
        let now = Utc::now();
        assert!(invite(now).is_valid(now));
    }

    #[test]
    fn used_invite_is_invalid() {
        let now = Utc::now();
        let mut inv = invite(now);
        inv.mark_used(now);
        assert!(!inv.is_valid(now));
        assert_eq!(inv.used_at, Some(now));
    }

    #[test]
    fn invite_expires_after_duration() {
        let now = Utc::now();
        let inv = invite(now);
        assert_eq!(inv.expires_at, now + Duration::minutes(30));
        assert!(!inv.is_valid(now + Duration::minutes(31)));
    }
}
