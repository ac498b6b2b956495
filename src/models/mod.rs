pub mod photo;
pub mod session;
pub mod tag;
pub mod trip;
pub mod user;
