pub mod payment;
pub mod gateway_record;
pub mod membership;
pub mod profile;
pub mod validation;

pub use payment::*;
pub use gateway_record::*;
pub use membership::*;
pub use profile::*;
