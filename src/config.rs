//! Configuration for the mailbox connection, the retrieval loop and the key ledger.
//!
//! Use [`MailboxConfigBuilder`] to create a mailbox configuration with sensible defaults:
//!
//! ```
//! use otp_keygate::MailboxConfig;
//!
//! let config = MailboxConfig::builder()
//!     .email("inbox@example.com")
//!     .password("app-password")
//!     .sender("codes@example.com")
//!     .build()
//!     .expect("valid config");
//! ```
//!
//! A whole service is usually configured from the environment through
//! [`ServiceConfig::from_env`].

use crate::error::{Error, Result};
use email_address::EmailAddress;
use secrecy::{ExposeSecret, SecretString};
use std::str::FromStr;
use std::time::Duration;

/// Host used when none is configured.
pub const DEFAULT_IMAP_HOST: &str = "imap.gmail.com";

/// Folder searched for codes.
pub const DEFAULT_FOLDER: &str = "INBOX";

/// Configuration for connecting to the IMAP mailbox that receives the codes.
///
/// Create using [`MailboxConfig::builder()`].
///
/// Note: The `password` field is stored as a [`SecretString`] to prevent
/// accidental logging of sensitive credentials.
#[derive(Clone)]
pub struct MailboxConfig {
    /// Login address of the mailbox.
    email: EmailAddress,
    /// Password or app-specific password (protected from accidental logging).
    password: SecretString,
    /// Only messages from this address are searched.
    sender: EmailAddress,
    /// IMAP server hostname.
    pub imap_host: String,
    /// IMAP server port (default: 993 for IMAPS).
    pub imap_port: u16,
    /// Whether to wrap the connection in TLS.
    pub tls: bool,
    /// Accept self-signed or otherwise unverifiable server certificates.
    pub accept_invalid_certs: bool,
    /// Folder that is selected after login.
    pub folder: String,
    /// Timeout configuration.
    pub timeouts: TimeoutConfig,
    /// Polling configuration for the retrieval loop.
    pub polling: PollingConfig,
}

impl std::fmt::Debug for MailboxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxConfig")
            .field("email", &self.email.as_str())
            .field("password", &"[REDACTED]")
            .field("sender", &self.sender.as_str())
            .field("imap_host", &self.imap_host)
            .field("imap_port", &self.imap_port)
            .field("tls", &self.tls)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("folder", &self.folder)
            .field("timeouts", &self.timeouts)
            .field("polling", &self.polling)
            .finish()
    }
}

impl MailboxConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> MailboxConfigBuilder {
        MailboxConfigBuilder::default()
    }

    /// Returns the login address as a string slice.
    #[must_use]
    pub fn email(&self) -> &str {
        self.email.as_str()
    }

    /// Returns the password as a string slice.
    ///
    /// The password is intentionally not directly accessible to prevent accidental logging.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Returns the sender address used to filter searches.
    #[must_use]
    pub fn sender(&self) -> &str {
        self.sender.as_str()
    }

    /// Returns the full IMAP server address as "host:port".
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.imap_host, self.imap_port)
    }
}

/// Timeout configuration for individual IMAP operations.
///
/// These bound in-flight I/O; the overall retrieval deadline lives in
/// [`PollingConfig::max_wait`].
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Timeout for establishing TCP/TLS connection.
    pub connect: Duration,
    /// Timeout for IMAP authentication.
    pub auth: Duration,
    /// Timeout for selecting a mailbox.
    pub select: Duration,
    /// Timeout for UID searches.
    pub search: Duration,
    /// Timeout for fetching message content.
    pub fetch: Duration,
    /// Timeout for logout operation.
    pub logout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            auth: Duration::from_secs(10),
            select: Duration::from_secs(10),
            search: Duration::from_secs(10),
            fetch: Duration::from_secs(15),
            logout: Duration::from_secs(5),
        }
    }
}

/// Polling configuration for the retrieval loop.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Pause between two mailbox checks.
    pub interval: Duration,
    /// Overall deadline of one retrieval request.
    pub max_wait: Duration,
    /// Full-message parsing is only attempted when a check returns at most this
    /// many candidates.
    pub fallback_threshold: usize,
    /// Number of UIDs below the newest one that are searched each check.
    pub window_span: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            max_wait: Duration::from_secs(20),
            fallback_threshold: 5,
            window_span: 12,
        }
    }
}

/// Validates an email address format.
fn validate_email(email: &str) -> Result<EmailAddress> {
    EmailAddress::parse_with_options(email, email_address::Options::default()).map_err(|_| {
        Error::InvalidEmailFormat {
            email: email.to_string(),
        }
    })
}

/// Builder for [`MailboxConfig`].
#[derive(Debug, Default)]
pub struct MailboxConfigBuilder {
    email: Option<String>,
    password: Option<String>,
    sender: Option<String>,
    imap_host: Option<String>,
    imap_port: Option<u16>,
    tls: Option<bool>,
    accept_invalid_certs: Option<bool>,
    folder: Option<String>,
    timeouts: Option<TimeoutConfig>,
    polling: Option<PollingConfig>,
}

impl MailboxConfigBuilder {
    /// Sets the login address (required).
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Sets the password (required).
    ///
    /// For Gmail/Outlook, use an app-specific password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the address codes are sent from (required).
    #[must_use]
    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    /// Sets the IMAP server hostname. Defaults to [`DEFAULT_IMAP_HOST`].
    #[must_use]
    pub fn imap_host(mut self, host: impl Into<String>) -> Self {
        self.imap_host = Some(host.into());
        self
    }

    /// Sets the IMAP server port.
    ///
    /// Default is 993 (IMAPS with TLS).
    #[must_use]
    pub fn imap_port(mut self, port: u16) -> Self {
        self.imap_port = Some(port);
        self
    }

    /// Enables or disables TLS. Enabled by default.
    #[must_use]
    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Accepts server certificates that cannot be verified. Enabled by default.
    #[must_use]
    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = Some(accept);
        self
    }

    /// Sets the folder to select. Defaults to [`DEFAULT_FOLDER`].
    #[must_use]
    pub fn folder(mut self, folder: impl Into<String>) -> Self {
        self.folder = Some(folder.into());
        self
    }

    /// Sets timeout configuration.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .connect = timeout;
        self
    }

    /// Sets the authentication timeout.
    #[must_use]
    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts
            .get_or_insert_with(TimeoutConfig::default)
            .auth = timeout;
        self
    }

    /// Sets polling configuration.
    #[must_use]
    pub fn polling(mut self, polling: PollingConfig) -> Self {
        self.polling = Some(polling);
        self
    }

    /// Sets the polling interval of the retrieval loop.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.polling
            .get_or_insert_with(PollingConfig::default)
            .interval = interval;
        self
    }

    /// Sets the retrieval deadline.
    #[must_use]
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.polling
            .get_or_insert_with(PollingConfig::default)
            .max_wait = max_wait;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or invalid.
    pub fn build(self) -> Result<MailboxConfig> {
        let email_raw = self.email.ok_or_else(|| Error::InvalidConfig {
            message: "email is required".into(),
        })?;
        let email = validate_email(&email_raw)?;

        let password_raw = self.password.ok_or_else(|| Error::InvalidConfig {
            message: "password is required".into(),
        })?;

        let sender_raw = self.sender.ok_or_else(|| Error::InvalidConfig {
            message: "sender is required".into(),
        })?;
        let sender = validate_email(&sender_raw)?;
        // The sender ends up inside a quoted IMAP string
        if sender.as_str().contains(['"', '\\']) {
            return Err(Error::InvalidEmailFormat { email: sender_raw });
        }

        let polling = self.polling.unwrap_or_default();
        if polling.interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "poll interval must be greater than zero".into(),
            });
        }

        Ok(MailboxConfig {
            email,
            password: SecretString::from(password_raw),
            sender,
            imap_host: self
                .imap_host
                .unwrap_or_else(|| DEFAULT_IMAP_HOST.to_string()),
            imap_port: self.imap_port.unwrap_or(993),
            tls: self.tls.unwrap_or(true),
            accept_invalid_certs: self.accept_invalid_certs.unwrap_or(true),
            folder: self.folder.unwrap_or_else(|| DEFAULT_FOLDER.to_string()),
            timeouts: self.timeouts.unwrap_or_default(),
            polling,
        })
    }
}

/// Lifetime and quota rules for newly created access keys.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPolicy {
    /// Uses granted to a new key.
    pub initial_uses: u32,
    /// Lifetime used when the creator does not ask for one.
    pub default_minutes: f64,
    /// Shortest lifetime accepted.
    pub min_minutes: f64,
    /// Longest lifetime accepted.
    pub max_minutes: f64,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            initial_uses: 2,
            default_minutes: 60.0,
            min_minutes: 1.0,
            max_minutes: 7.0 * 24.0 * 60.0,
        }
    }
}

impl KeyPolicy {
    /// Checks that the policy can issue keys at all.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] when no uses are granted, a bound is not a
    /// positive finite number, or the default lies outside `min..=max`.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(Error::InvalidConfig {
                message: format!("key policy: {message}"),
            })
        };

        if self.initial_uses == 0 {
            return invalid("a key needs at least one use");
        }
        let bounds = [self.default_minutes, self.min_minutes, self.max_minutes];
        if !bounds.iter().all(|minutes| minutes.is_finite()) {
            return invalid("durations must be finite");
        }
        if self.min_minutes <= 0.0 {
            return invalid("minimum duration must be positive");
        }
        if !(self.min_minutes..=self.max_minutes).contains(&self.default_minutes) {
            return invalid("default duration must lie between min and max");
        }
        Ok(())
    }
}

/// Everything the `otp-keygate` binary needs to run.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Mailbox connection and polling.
    pub mailbox: MailboxConfig,
    /// Key lifetime and quota rules.
    pub keys: KeyPolicy,
    /// Shared secret for the admin routes; admin routes are disabled without it.
    pub admin_secret: Option<SecretString>,
    /// HTTP listen port.
    pub port: u16,
    /// Raise the default log level to `debug`.
    pub debug: bool,
}

impl ServiceConfig {
    /// Loads the configuration from the process environment, reading `.env` first
    /// when present.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or a value cannot be parsed.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine in production
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error when a required variable is missing or a value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &str| {
            var(key).ok_or_else(|| Error::InvalidConfig {
                message: format!("{key} is required"),
            })
        };

        let defaults = PollingConfig::default();
        let polling = PollingConfig {
            interval: parse_var(&var, "POLL_INTERVAL_MS")?
                .map_or(defaults.interval, Duration::from_millis),
            max_wait: parse_var(&var, "RETRIEVAL_TIMEOUT_MS")?
                .map_or(defaults.max_wait, Duration::from_millis),
            fallback_threshold: parse_var(&var, "FALLBACK_THRESHOLD")?
                .unwrap_or(defaults.fallback_threshold),
            window_span: parse_var(&var, "WINDOW_SPAN")?.unwrap_or(defaults.window_span),
        };

        let mut builder = MailboxConfig::builder()
            .email(required("EMAIL")?)
            .password(required("PASSWORD")?)
            .sender(required("OTP_FROM")?)
            .tls(parse_flag(&var, "IMAP_TLS")?.unwrap_or(true))
            .accept_invalid_certs(parse_flag(&var, "IMAP_ACCEPT_INVALID_CERTS")?.unwrap_or(true))
            .polling(polling);
        if let Some(host) = var("IMAP_HOST") {
            builder = builder.imap_host(host);
        }
        if let Some(port) = parse_var(&var, "IMAP_PORT")? {
            builder = builder.imap_port(port);
        }
        let mailbox = builder.build()?;

        let key_defaults = KeyPolicy::default();
        let keys = KeyPolicy {
            initial_uses: parse_var(&var, "KEY_USES")?.unwrap_or(key_defaults.initial_uses),
            default_minutes: parse_var(&var, "KEY_DEFAULT_MINUTES")?
                .unwrap_or(key_defaults.default_minutes),
            min_minutes: parse_var(&var, "KEY_MIN_MINUTES")?.unwrap_or(key_defaults.min_minutes),
            max_minutes: parse_var(&var, "KEY_MAX_MINUTES")?.unwrap_or(key_defaults.max_minutes),
        };
        keys.validate()?;

        Ok(Self {
            mailbox,
            keys,
            admin_secret: var("ADMIN_SECRET").map(SecretString::from),
            port: parse_var(&var, "PORT")?.unwrap_or(3000),
            debug: parse_flag(&var, "DEBUG")?.unwrap_or(false),
        })
    }
}

fn parse_var<T, F>(var: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|raw| {
            raw.trim().parse().map_err(|_| Error::InvalidConfig {
                message: format!("{key} has an invalid value: {raw}"),
            })
        })
        .transpose()
}

fn parse_flag<F>(var: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    var(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(Error::InvalidConfig {
                message: format!("{key} must be true or false, got {raw}"),
            }),
        })
        .transpose()
}
