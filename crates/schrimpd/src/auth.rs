//! Authentication gate: optional shared password and display-name
//! negotiation.
//!
//! The state machine per connection is AwaitingPassword (skipped when no
//! password is configured, exactly one attempt) -> AwaitingName (re-prompted
//! on conflicts, no retry cap) -> Admitted. The connection handler drives it;
//! this module owns the policy and the prompt text.

use subtle::ConstantTimeEq;

pub const AUTH_OK: &str = "Authentication successful!\nEnter your username: ";
pub const AUTH_FAIL: &str = "Incorrect password. Connection closed.\n";

#[derive(Debug)]
pub struct AuthGate {
    password: Option<String>,
}

impl AuthGate {
    pub fn new(password: Option<String>) -> Self {
        let password = password.filter(|p| !p.is_empty());
        Self { password }
    }

    pub fn password_required(&self) -> bool {
        self.password.is_some()
    }

    /// Constant-time password check. Always false when no password is set;
    /// callers must gate on `password_required` first.
    pub fn verify(&self, attempt: &str) -> bool {
        match &self.password {
            Some(pw) => attempt.as_bytes().ct_eq(pw.as_bytes()).into(),
            None => false,
        }
    }

    pub fn welcome_banner(&self) -> String {
        let mut s = String::from("\n");
        s.push_str(&"=".repeat(50));
        s.push_str("\nWelcome to Schrimp Chat!\n");
        s.push_str(&"=".repeat(50));
        s.push('\n');
        if self.password.is_some() {
            s.push_str("Password required\nEnter password: ");
        } else {
            s.push_str("Enter your username: ");
        }
        s
    }
}

/// A trimmed candidate name, or the port-derived fallback when the client
/// sent nothing usable.
pub fn candidate_name(input: &str, port: u16) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        format!("Anonymous_{port}")
    } else {
        trimmed.to_string()
    }
}

pub fn name_taken_prompt(name: &str) -> String {
    format!("Username '{name}' is already taken. Choose another: ")
}

pub fn connection_info(name: &str, count: usize) -> String {
    let mut s = format!("\nConnected as: {name}\n");
    s.push_str(&format!("Connected users: {count}\n"));
    s.push_str("Type your messages and press Enter\n");
    s.push_str("Type '/quit' to leave\n");
    s.push_str("Type '/users' to see connected users\n");
    s.push_str(&"-".repeat(30));
    s.push('\n');
    s
}
