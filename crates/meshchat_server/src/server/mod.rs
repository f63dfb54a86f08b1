#![forbid(unsafe_code)]

pub mod auth;
pub mod dispatcher;
pub mod health;
pub mod ingest;
pub mod lifecycle;
pub mod publisher;
pub mod subscription;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod auth_tests;





#[cfg(test)]
mod publisher_tests;
