pub mod console;
pub mod fault_injection;
pub mod fault_rules;
pub mod packet;
pub mod relay;
pub mod relay_config;
pub mod session;
pub mod socket;
pub mod test_util;
