pub mod admin;
pub mod memberships;
pub mod payments;
pub mod root;
pub mod webhooks;
