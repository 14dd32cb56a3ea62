//! Gateway configuration, loaded from environment variables.

use std::net::SocketAddr;

/// Generic configuration options for the gateway.
#[derive(Debug, Clone)]
pub struct Config {
    /// Version of the running binary, used as the default image tag.
    pub version: String,
    /// Address the HTTP server binds to (`APP_ADDRESS`, default `:4020`).
    pub address: String,
    /// Whether the gateway serves production LFS.X instances.
    pub production: bool,
    /// URL of the LFS endpoint the login credentials are validated against.
    pub lfs_service_endpoint: String,
    /// Symmetric key used to validate tokens and decrypt their fields.
    pub jwt_key: Vec<u8>,
    /// Name of the authentication cookie issued by the gateway.
    pub jwt_cookie_name: String,
    /// Port of the per-pod host API.
    pub lfs_api_port: u16,
    /// Prefix for pod/job names and the `app` label.
    pub base_app_name: String,

    /// Docker image that runs an LFS.X container. Defaults to `<registry>:<version>`.
    pub lfs_image_name: String,
    /// When set, the image name is re-read from this file on every use so a
    /// rollout can swap the image without restarting the gateway.
    pub lfs_image_name_file: String,

    pub dev: DevConfig,
}

/// Options that are only relevant during development.
#[derive(Debug, Clone, Default)]
pub struct DevConfig {
    /// Serve frontend assets from an external dev server instead of the binary.
    pub dev_server: bool,
    pub dev_server_port: u16,
    /// Static `host:port` of a VNC backend, bypassing the cluster.
    pub vnc_address: String,
    /// Static `host:port` of a guacd backend, bypassing the cluster.
    pub guacamole_address: String,
    /// Static `host:port` of the pod application API (control socket + app proxy).
    pub app_address: String,
    /// Static `host:port` of the pod host API.
    pub host_address: String,
}

impl DevConfig {
    /// True when any static backend address bypasses the allocator.
    pub fn bypasses_cluster(&self) -> bool {
        !self.vnc_address.is_empty() || !self.guacamole_address.is_empty()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing
    /// or the JWT key file cannot be read.
    pub fn from_env(version: &str) -> Self {
        let jwt_key_path = env_string("APP_JWT_FILE", "./key.txt");
        let jwt_key = std::fs::read(&jwt_key_path)
            .unwrap_or_else(|e| panic!("cannot read JWT key from file {jwt_key_path:?}: {e}"));

        let lfs_image_name = env_string(
            "APP_LFS_IMAGE_NAME",
            &format!(
                "{}:{}",
                env_string(
                    "APP_LFS_IMAGE_REGISTRY",
                    "containers-next.hama.de/registry-hama-test/lfsx-web-lfs",
                ),
                version
            ),
        );

        Self {
            version: version.to_string(),
            address: env_string("APP_ADDRESS", ":4020"),
            production: env_bool("APP_PRODUCTION", true),
            lfs_service_endpoint: required_var("APP_LFS_SERVICE_ENDPOINT"),
            jwt_key,
            jwt_cookie_name: env_string("APP_LFS_SERVICE_ENDPOINT_JWT_NAME", "JWTAuthentication"),
            lfs_api_port: env_u16("APP_LFS_API_PORT", 4021),
            base_app_name: env_string("BASE_APP_NAME", "lfsx-web"),
            lfs_image_name,
            lfs_image_name_file: env_string("APP_LFS_IMAGE_NAME_FILE", ""),
            dev: DevConfig {
                dev_server: env_bool("APP_DEV_USE_DEVSERVER", false),
                dev_server_port: env_u16("APP_DEV_SERVER_PORT", 5173),
                vnc_address: env_string("APP_DEV_VNC_ADDRESS", ""),
                guacamole_address: env_string("APP_DEV_GUACAMOL_ADDRESS", ""),
                app_address: env_string("APP_DEV_APP_ADDRESS", ""),
                host_address: env_string("APP_DEV_HOST_ADDRESS", ""),
            },
        }
    }

    /// The socket address to listen on. `:4020` binds all interfaces.
    pub fn listen_addr(&self) -> SocketAddr {
        let addr = if self.address.starts_with(':') {
            format!("0.0.0.0{}", self.address)
        } else {
            self.address.clone()
        };
        addr.parse()
            .unwrap_or_else(|e| panic!("invalid APP_ADDRESS {:?}: {e}", self.address))
    }

    /// The image name for the LFS.X container, re-read from the image file
    /// when one is configured.
    pub fn lfs_image(&self) -> String {
        if !self.lfs_image_name_file.is_empty() {
            match std::fs::read_to_string(&self.lfs_image_name_file) {
                Ok(content) => return content.trim().to_string(),
                Err(e) => {
                    tracing::warn!(?e, file = %self.lfs_image_name_file, "failed to read image tag");
                }
            }
        }
        self.lfs_image_name.clone()
    }

    /// The image version label: everything after the last `:`, truncated to
    /// 60 characters (labels are capped at 63).
    pub fn lfs_image_version(&self) -> String {
        let image = self.lfs_image();
        let version = match image.rfind(':') {
            Some(index) => &image[index + 1..],
            None => &image,
        };
        cut_off(version, 60).to_string()
    }
}

fn cut_off(val: &str, length: usize) -> &str {
    match val.char_indices().nth(length) {
        Some((index, _)) => &val[..index],
        None => val,
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
