pub mod backup;
pub mod geocode;
pub mod photo_meta;
pub mod storage;
pub mod trips;
