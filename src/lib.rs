#[macro_use]
extern crate rocket;
#[macro_use]
extern crate lopdf;

use log::{error, info, warn};
use serde::Deserialize;
use rocket_sync_db_pools::database;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub mod auth;
pub mod compositor;
pub mod error;
pub mod files;
pub mod geometry;
pub mod models;
pub mod notify;
pub mod pdf;
pub mod schema;
pub mod signing;
mod store;
pub mod views;

pub use error::Error;

#[database("db")]
pub struct DbConn(diesel::PgConnection);

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

pub async fn db_run<
    T: 'static + std::marker::Send,
    F: 'static + FnOnce(&mut diesel::PgConnection) -> Result<T, Error> + std::marker::Send
>(db: &DbConn, func: F) -> Result<T, Error> {
    match db.run(func).await {
        Ok(r) => Ok(r),
        Err(Error::Database(e)) => {
            warn!("DB error: {}", e);
            Err(Error::Database(e))
        }
        Err(e) => Err(e)
    }
}

pub trait IdKind {
    const PREFIX: &'static str;
}

#[derive(Debug, Clone, Copy)]
pub struct DocumentKind;

#[derive(Debug, Clone, Copy)]
pub struct FieldKind;

impl IdKind for DocumentKind {
    const PREFIX: &'static str = "esign_document";
}

impl IdKind for FieldKind {
    const PREFIX: &'static str = "esign_field";
}

#[derive(Debug, Clone, Copy)]
pub struct TypedUUIDField<T: IdKind> {
    pub uuid: uuid::Uuid,
    kind: std::marker::PhantomData<T>,
}

pub type DocumentID = TypedUUIDField<DocumentKind>;
pub type FieldID = TypedUUIDField<FieldKind>;

impl<T: IdKind> TypedUUIDField<T> {
    pub fn new(uuid: uuid::Uuid) -> Self {
        Self {
            uuid,
            kind: std::marker::PhantomData,
        }
    }
}

impl<T: IdKind> std::fmt::Display for TypedUUIDField<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", T::PREFIX, self.uuid.simple())
    }
}

impl<T: IdKind> std::str::FromStr for TypedUUIDField<T> {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match uuid::Uuid::parse_str(s.strip_prefix(&format!("{}_", T::PREFIX)).unwrap_or(s)) {
            Ok(id) => Ok(Self::new(id)),
            Err(_) => Err("invalid UUID")
        }
    }
}

impl<'a, T: IdKind> rocket::request::FromParam<'a> for TypedUUIDField<T> {
    type Error = &'static str;

    fn from_param(param: &'a str) -> Result<Self, Self::Error> {
        param.parse()
    }
}

impl<T: IdKind> serde::Serialize for TypedUUIDField<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error> where S: serde::Serializer {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompositeMode {
    #[default]
    Flatten,
    Passthrough,
}

#[derive(Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "from_base64")]
    pub files_key: Vec<u8>,
    #[serde(deserialize_with = "from_base64")]
    pub token_key: Vec<u8>,
    #[serde(default = "default_files_dir")]
    pub files_dir: std::path::PathBuf,
    pub external_uri: String,
    #[serde(default)]
    pub composite_mode: CompositeMode,
    #[serde(default)]
    pub smtp: Option<SMTPConfig>,
    #[serde(default)]
    pub email: EmailConfig,
}

#[derive(Deserialize, Clone)]
pub struct SMTPConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub auth: Option<SMTPAuth>
}

#[derive(Deserialize, Clone)]
pub struct SMTPAuth {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize, Clone)]
pub struct EmailConfig {
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub outbox_dir: Option<std::path::PathBuf>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from: default_from(),
            reply_to: None,
            outbox_dir: None,
        }
    }
}

fn default_files_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("./files/")
}

fn default_from() -> String {
    "DocSign <esign@localhost>".to_string()
}

fn from_base64<'a, D: serde::Deserializer<'a>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    use serde::de::Error;
    String::deserialize(deserializer)
        .and_then(|string| base64::decode(&string).map_err(|err| Error::custom(err.to_string())))
}

/// Rocket's default figment with `DOCSIGN_`-prefixed environment variables layered on top.
pub fn figment() -> figment::Figment {
    rocket::Config::figment()
        .merge(figment::providers::Env::prefixed("DOCSIGN_").global())
}

pub struct App {
    pub rocket: rocket::Rocket<rocket::Build>,
}

pub async fn setup() -> App {
    let rocket = rocket::custom(figment());
    let config = match rocket.figment().extract::<Config>() {
        Ok(c) => c,
        Err(err) => {
            error!("Unable to read config: {}", err);
            std::process::exit(-1);
        }
    };

    if config.files_key.is_empty() || config.token_key.is_empty() {
        error!("files_key and token_key must both be set");
        std::process::exit(-1);
    }

    if let Err(err) = tokio::fs::create_dir_all(&config.files_dir).await {
        error!("Unable to create files directory {}: {}", config.files_dir.display(), err);
        std::process::exit(-1);
    }
    if let Some(outbox_dir) = &config.email.outbox_dir {
        if let Err(err) = tokio::fs::create_dir_all(outbox_dir).await {
            error!("Unable to create outbox directory {}: {}", outbox_dir.display(), err);
            std::process::exit(-1);
        }
    }

    let mailer = match notify::Mailer::from_config(&config) {
        Ok(m) => m,
        Err(err) => {
            error!("Unable to setup mailer: {}", err);
            std::process::exit(-1);
        }
    };
    let compositor = compositor::Compositor::new(config.files_dir.clone(), config.composite_mode);
    info!("Storing files in {} (compositing: {:?})", config.files_dir.display(), config.composite_mode);

    App {
        rocket: rocket
            .manage(config)
            .manage(mailer)
            .manage(compositor)
            .attach(DbConn::fairing())
            .attach(rocket::fairing::AdHoc::try_on_ignite("Database Migrations", run_migrations)),
    }
}

async fn run_migrations(rocket: rocket::Rocket<rocket::Build>) -> rocket::fairing::Result {
    let conn = match DbConn::get_one(&rocket).await {
        Some(c) => c,
        None => {
            error!("Unable to get a database connection for migrations");
            return Err(rocket);
        }
    };

    match conn.run(|c| {
        c.run_pending_migrations(MIGRATIONS)
            .map(|applied| applied.len())
            .map_err(|err| err.to_string())
    }).await {
        Ok(n) => {
            info!("Applied {} pending migrations", n);
            Ok(rocket)
        }
        Err(err) => {
            error!("Unable to run migrations: {}", err);
            Err(rocket)
        }
    }
}
