use thiserror::Error;

/// An error talking to the IBM Cloud APIs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodeEngineError {
    #[error("Failed to authenticate with IBM Cloud IAM")]
    Authentication,
    #[error("Failed to set up the HTTP client")]
    ClientSetup,
    #[error("Request failed")]
    Request,
    #[error("Request returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Failed to parse response")]
    Decode,
}

impl CodeEngineError {
    /// The HTTP status code, if the service returned an unsuccessful response.
    pub fn status(&self) -> Option<u16> {
        match self {
            CodeEngineError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing configuration value cloudprovider.ibm.{0}")]
    Missing(&'static str),
    #[error("Invalid value for cloudprovider.ibm.{0}")]
    Invalid(&'static str),
    #[error("Failed to read configuration file {0}")]
    Read(String),
    #[error("Failed to parse configuration file")]
    Parse,
    #[error("Invalid cluster name {0:?}")]
    InvalidName(String),
    #[error("Failed to create the Code Engine client")]
    Client,
}
