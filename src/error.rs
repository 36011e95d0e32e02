use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[error("{message}")]
pub struct AppError {
  pub code: &'static str,
  pub message: String,
}

impl AppError {
  pub fn invalid_input(message: impl Into<String>) -> Self {
    Self {
      code: "invalid_input",
      message: message.into(),
    }
  }

  /// Recipe definition is malformed (cycle, missing dependency, bad operation).
  pub fn validation(message: impl Into<String>) -> Self {
    Self {
      code: "validation",
      message: message.into(),
    }
  }

  pub fn not_found(message: impl Into<String>) -> Self {
    Self {
      code: "not_found",
      message: message.into(),
    }
  }

  /// Command is not legal in the execution's current status.
  pub fn invalid_state(message: impl Into<String>) -> Self {
    Self {
      code: "invalid_state",
      message: message.into(),
    }
  }

  /// Input or dispatch attempted while a human holds the intervention lock.
  pub fn intervention_conflict(message: impl Into<String>) -> Self {
    Self {
      code: "intervention_conflict",
      message: message.into(),
    }
  }

  pub fn io(message: impl Into<String>) -> Self {
    Self {
      code: "io",
      message: message.into(),
    }
  }

  pub fn http(message: impl Into<String>) -> Self {
    Self {
      code: "http",
      message: message.into(),
    }
  }

  pub fn command(message: impl Into<String>) -> Self {
    Self {
      code: "command",
      message: message.into(),
    }
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self {
      code: "timeout",
      message: message.into(),
    }
  }

  pub fn cancelled(message: impl Into<String>) -> Self {
    Self {
      code: "cancelled",
      message: message.into(),
    }
  }

  pub fn not_implemented(message: impl Into<String>) -> Self {
    Self {
      code: "not_implemented",
      message: message.into(),
    }
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self {
      code: "internal",
      message: message.into(),
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.code == "cancelled"
  }

  pub fn is_timeout(&self) -> bool {
    self.code == "timeout"
  }
}

impl From<std::io::Error> for AppError {
  fn from(value: std::io::Error) -> Self {
    Self::io(value.to_string())
  }
}

impl From<reqwest::Error> for AppError {
  fn from(value: reqwest::Error) -> Self {
    Self::http(value.to_string())
  }
}

impl From<serde_json::Error> for AppError {
  fn from(value: serde_json::Error) -> Self {
    Self::invalid_input(value.to_string())
  }
}

impl From<toml::de::Error> for AppError {
  fn from(value: toml::de::Error) -> Self {
    Self::validation(format!("Invalid recipe TOML: {value}"))
  }
}

impl From<toml::ser::Error> for AppError {
  fn from(value: toml::ser::Error) -> Self {
    Self::io(format!("Failed to serialize recipe: {value}"))
  }
}
