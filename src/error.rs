use thiserror::Error;

/// Errors raised by node behaviours, constructors and close handlers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeError {
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("close failed: {0}")]
    CloseFailed(String),
    #[error("panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage write failed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("type {0} already registered")]
    AlreadyRegistered(String),
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("unknown module: {0}")]
    UnknownModule(String),
    #[error("settings persistence unavailable")]
    SettingsUnavailable,
    #[error("settings error: {0}")]
    Settings(String),
    #[error("type {type_name} is in use by node {node_id}")]
    TypeInUse { type_name: String, node_id: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("{}", missing_types_report(.0))]
    MissingTypes(Vec<String>),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("subflow {0} contains itself")]
    RecursiveSubflow(String),
}

/// One line per type so an operator can see at a glance what to install.
pub fn missing_types_report(types: &[String]) -> String {
    let mut report = String::from("Waiting for missing types to be registered:");
    for t in types {
        report.push_str("\n - ");
        report.push_str(t);
    }
    report
}
