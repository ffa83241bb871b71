use log::info;
use std::env;
use std::error::Error;

/// Parameter names under which the BCCh credentials are stored.  Both can be
/// overridden from the environment.
pub const USER_PARAM_VAR: &str = "SSM_USER_PARAM";
pub const PASS_PARAM_VAR: &str = "SSM_PASS_PARAM";
pub const DEFAULT_USER_PARAM: &str = "/bcch/username";
pub const DEFAULT_PASS_PARAM: &str = "/bcch/password";

/// A named-parameter store with secret values, e.g. AWS SSM Parameter Store.
/// The hosted implementation lives outside this crate; locally the parameters
/// come from the environment, see [EnvSecretStore].
pub trait SecretStore {
    fn get_parameter(&self, name: &str, with_decryption: bool) -> Result<String, Box<dyn Error>>;
}

/// Resolve parameters against environment variables.  A parameter path like
/// `/bcch/username` maps to the variable `BCCH_USERNAME`.
pub struct EnvSecretStore;

/// `/bcch/username` -> `BCCH_USERNAME`
pub fn env_name(param: &str) -> String {
    param
        .trim_start_matches('/')
        .replace(['/', '-', '.'], "_")
        .to_uppercase()
}

impl SecretStore for EnvSecretStore {
    fn get_parameter(&self, name: &str, _with_decryption: bool) -> Result<String, Box<dyn Error>> {
        let var = env_name(name);
        env::var(&var)
            .map_err(|_| Box::from(format!("parameter {} not set (env var {})", name, var)))
    }
}

/// BCCh web service credentials.  Fetched once at process start and reused for
/// the lifetime of the process.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    /// Fetch both credential parameters with decryption enabled.  If either
    /// fetch fails the caller should treat the process as degraded; there is
    /// no retry here.
    pub fn load(store: &dyn SecretStore) -> Result<Credentials, Box<dyn Error>> {
        let user_param =
            env::var(USER_PARAM_VAR).unwrap_or_else(|_| DEFAULT_USER_PARAM.to_string());
        let pass_param =
            env::var(PASS_PARAM_VAR).unwrap_or_else(|_| DEFAULT_PASS_PARAM.to_string());
        info!("fetching BCCh credentials from {} and {}", user_param, pass_param);
        let user = store.get_parameter(&user_param, true)?;
        let pass = store.get_parameter(&pass_param, true)?;
        Ok(Credentials { user, pass })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print the password
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}
