pub mod error;
pub mod fabric;
pub mod hypervisor;
pub mod lifecycle;
pub mod model;
pub mod os_bridge;
pub mod registries;
pub mod renderer;
pub mod retry;
pub mod settings;
pub mod status;
pub mod worker;
