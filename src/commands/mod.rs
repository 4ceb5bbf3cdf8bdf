pub mod bench;
pub mod run;
pub mod verify;

pub const EXIT_INTERNAL: u8 = 1;
pub const EXIT_NOT_CONVERGED: u8 = 2;
pub const EXIT_CONFIGURATION: u8 = 3;
pub const EXIT_VERIFICATION_FAILED: u8 = 4;
