//! Explicit session context.
//!
//! A session is the pair (identifier, role) a client keeps between reloads.
//! It is built on login and consumed on logout; live listeners registered for
//! the session are released with it.

use tracing::debug;

use crate::{error::AppError, structure::Role, sync::Subscription};

/// Identifiers containing this marker (case-insensitive) are privileged.
pub const ADMIN_MARKER: &str = "ADMIN";

/// Characters the store cannot hold in a key.
const FORBIDDEN_KEY_CHARS: [char; 6] = ['/', '.', '#', '$', '[', ']'];

pub fn derive_role(identifier: &str) -> Role {
    if identifier.to_uppercase().contains(ADMIN_MARKER) {
        Role::Admin
    } else {
        Role::Student
    }
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let identifier = identifier.trim();

    if identifier.is_empty() {
        return Err(AppError::ValidationFailed("roll number is required".to_string()));
    }
    if identifier.contains(FORBIDDEN_KEY_CHARS) {
        return Err(AppError::ValidationFailed(format!(
            "roll number '{identifier}' contains a reserved character"
        )));
    }

    Ok(identifier)
}

pub struct Session {
    roll_number: String,
    role: Role,
    subscriptions: Vec<Subscription>,
}

impl Session {
    /// Start a session for `roll_number` with the role its identifier implies.
    pub fn new(roll_number: &str) -> Result<Self, AppError> {
        let roll_number = validate_identifier(roll_number)?;

        Ok(Self {
            roll_number: roll_number.to_string(),
            role: derive_role(roll_number),
            subscriptions: Vec::new(),
        })
    }

    /// Rebuild a session from the persisted (identifier, role) pair. Both must
    /// be present; the role is re-derived from the identifier rather than
    /// trusted.
    pub fn restore(identifier: Option<&str>, role: Option<&str>) -> Option<Self> {
        let identifier = identifier?;
        role.filter(|role| !role.trim().is_empty())?;

        Self::new(identifier).ok()
    }

    pub(crate) fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn roll_number(&self) -> &str {
        &self.roll_number
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self, action: &str) -> Result<(), AppError> {
        if !self.is_admin() {
            debug!(roll_number = %self.roll_number, action, "admin check failed");
            return Err(AppError::Unauthorized(format!("Only admins can {action}")));
        }
        Ok(())
    }

    /// Keep `subscription` alive for as long as the session lasts.
    pub fn hold(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn live_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// End the session, releasing every listener it holds.
    pub async fn close(self) -> String {
        for subscription in self.subscriptions {
            subscription.unsubscribe().await;
        }
        self.roll_number
    }
}
