//! Database models split into domain-specific modules.

pub mod activity;
pub mod assignment_rule;
pub mod cloud_account;
pub mod cluster_type;
pub mod organization;
pub mod resource;

pub use activity::*;
pub use assignment_rule::*;
pub use cloud_account::*;
pub use cluster_type::*;
pub use organization::*;
pub use resource::*;
