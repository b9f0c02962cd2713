use envconfig::Envconfig;

/// Environment-driven configuration, mirroring the teacher's app-example
/// `Config` (`eventually-test/src/config.rs`, `orders-http-api-postgres-store`).
#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "DB_HOST", default = "localhost")]
    pub db_host: String,

    #[envconfig(from = "DB_PORT", default = "5432")]
    pub db_port: u16,

    #[envconfig(from = "DB_USERNAME", default = "postgres")]
    pub db_username: String,

    #[envconfig(from = "DB_PASSWORD", default = "password")]
    pub db_password: String,

    #[envconfig(from = "DB_DATABASE", default = "postgres")]
    pub db_database: String,

    #[envconfig(from = "DB_POOL_SIZE", default = "10")]
    pub db_pool_size: u32,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    pub fn postgres_dsn(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.db_username, self.db_password, self.db_host, self.db_port, self.db_database
        )
    }
}
