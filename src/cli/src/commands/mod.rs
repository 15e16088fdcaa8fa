pub mod backends;
pub mod config;
pub mod envs;
pub mod extensions;
pub mod health;
pub mod jobs;
pub mod scheduler;
