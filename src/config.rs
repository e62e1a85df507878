use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
    pub model_path: String,
    pub allowed_origin: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        let workers = env::var("WORKERS")
            .ok()
            .and_then(|w| w.parse().ok())
            .unwrap_or_else(num_cpus::get);
        let model_path =
            env::var("MODEL_PATH").unwrap_or_else(|_| "models/signbert.onnx".to_string());
        let allowed_origin = env::var("ALLOWED_ORIGIN")
            .unwrap_or_else(|_| "https://sonsation.netlify.app".to_string());

        ServerConfig {
            host,
            port,
            workers,
            model_path,
            allowed_origin,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
