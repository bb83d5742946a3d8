//! Palisade Security - Source scanning and plugin signatures.

mod scanner;
mod signer;

pub use scanner::{
    ALLOWED_MODULES, FORBIDDEN_MODULES, Finding, FindingKind, ScanReport, Scanner,
};
pub use signer::{
    SIGNATURE_FILE, SignatureRecord, SigningKey, compute_digest, read_signature, sign_plugin,
    verify_plugin,
};
