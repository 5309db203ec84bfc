//! Access control for the twin gateway: per-identity access trees and the
//! security subsystem resolving identities to them.

pub mod access;
pub mod security;

pub use access::{AccessNode, AccessTree};
pub use security::{AuthenticationService, SecuredAccess, StaticSecuredAccess};
