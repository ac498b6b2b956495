use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use sha2::{Digest, Sha512};

use crate::{
    config::AppConfig,
    db::DbPool,
    services::{
        geocode::GeocodeService,
        storage::{StorageService, UrlSigner},
        trips::TripService,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: DbPool,
    pub storage: StorageService,
    pub trips: TripService,
    pub geocode: GeocodeService,
    pub cookie_key: Key,
}

impl AppState {
    pub fn new(config: AppConfig, db: DbPool) -> Self {
        let digest = Sha512::digest(config.cookie_secret.as_bytes());
        let cookie_key = Key::from(&digest[..]);

        let signer = UrlSigner::new(config.signing_secret.as_bytes(), config.signed_url_ttl);
        let storage = StorageService::new(config.storage_root.clone(), signer);
        let trips = TripService::new(db.clone(), storage.clone(), config.max_upload_bytes);
        let geocode = GeocodeService::new(
            config.mapy_cz_base_url.clone(),
            config.mapy_cz_api_key.clone(),
        );

        Self {
            config,
            db,
            storage,
            trips,
            geocode,
            cookie_key,
        }
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}
