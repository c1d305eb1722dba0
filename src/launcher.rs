//! Local Chromium launcher
//!
//! Spawns a browser on a pooled debugging port, waits for `/json/version` to
//! answer and hands back the browser WebSocket URL. The child is killed and the
//! port returned to its pool when the [`LocalBrowser`] is dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument, warn};

use crate::cdp::fetch_version;
use crate::config::Config;
use crate::ports::{PortLease, PortPool};
use crate::{Error, Result};

#[cfg(target_os = "macos")]
const CHROME_CANDIDATES: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

#[cfg(target_os = "windows")]
const CHROME_CANDIDATES: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
];

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const CHROME_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
];

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How to start a local browser
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Browser binary; looked up on the system when unset
    pub executable: Option<PathBuf>,
    pub headless: bool,
    /// Profile directory; a throwaway one is created when unset
    pub data_dir: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub window_size: Option<(u32, u32)>,
    pub startup_timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            data_dir: None,
            extra_args: Vec::new(),
            window_size: None,
            startup_timeout: Duration::from_secs(15),
        }
    }
}

impl LaunchOptions {
    pub fn from_config(config: &Config) -> Self {
        let window_size = (config.viewport_width > 0 && config.viewport_height > 0)
            .then_some((config.viewport_width, config.viewport_height));
        Self {
            executable: config.chrome_path.as_ref().map(PathBuf::from),
            headless: config.headless,
            data_dir: config.chrome_data_dir.as_ref().map(PathBuf::from),
            extra_args: config.chrome_args.clone(),
            window_size,
            startup_timeout: config.default_timeout(),
        }
    }
}

/// First Chromium-family binary found on this system
pub fn find_chrome() -> Option<PathBuf> {
    CHROME_CANDIDATES.iter().find_map(|candidate| {
        let path = Path::new(candidate);
        if path.is_absolute() {
            path.exists().then(|| path.to_path_buf())
        } else {
            which::which(candidate).ok()
        }
    })
}

/// Command line for a browser listening on `port` with `profile` as its data dir
pub fn chrome_args(port: u16, profile: &Path, options: &LaunchOptions) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", port),
        "--remote-debugging-address=127.0.0.1".to_string(),
        format!("--user-data-dir={}", profile.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-background-networking".to_string(),
        "--disable-sync".to_string(),
        "--disable-translate".to_string(),
        "--metrics-recording-only".to_string(),
        "--password-store=basic".to_string(),
    ];
    if options.headless {
        args.push("--headless=new".to_string());
    }
    if let Some((width, height)) = options.window_size {
        args.push(format!("--window-size={},{}", width, height));
    }
    args.extend(options.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

#[derive(Debug)]
enum Profile {
    Temporary(TempDir),
    Given(PathBuf),
}

impl Profile {
    fn path(&self) -> &Path {
        match self {
            Profile::Temporary(dir) => dir.path(),
            Profile::Given(path) => path,
        }
    }
}

/// A browser process owned by this crate
#[derive(Debug)]
pub struct LocalBrowser {
    child: Child,
    lease: PortLease,
    profile: Profile,
    ws_url: String,
}

impl LocalBrowser {
    /// Start a browser and wait until its debugging endpoint answers
    #[instrument(skip(pool, options))]
    pub async fn launch(pool: &PortPool, options: &LaunchOptions) -> Result<Self> {
        let executable = match &options.executable {
            Some(path) => path.clone(),
            None => find_chrome()
                .ok_or_else(|| Error::configuration("No Chrome/Chromium binary found; set chrome_path"))?,
        };

        let profile = match &options.data_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                Profile::Given(dir.clone())
            }
            None => Profile::Temporary(
                tempfile::Builder::new()
                    .prefix("chaser-engine-profile-")
                    .tempdir()?,
            ),
        };

        let lease = pool.allocate()?;
        let port = lease.port();
        let args = chrome_args(port, profile.path(), options);

        info!("Launching {} on port {}", executable.display(), port);
        debug!("Browser args: {:?}", args);

        let child = Command::new(&executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::connection(format!("Failed to launch {}: {}", executable.display(), e)))?;

        let mut browser = Self {
            child,
            lease,
            profile,
            ws_url: String::new(),
        };
        browser.ws_url = browser.wait_ready(options.startup_timeout).await?;
        info!("Browser ready at {}", browser.ws_url);
        Ok(browser)
    }

    async fn wait_ready(&mut self, timeout: Duration) -> Result<String> {
        let endpoint = format!("http://127.0.0.1:{}", self.port());
        let started = Instant::now();

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(Error::connection(format!(
                    "Browser exited during startup ({})",
                    status
                )));
            }

            match fetch_version(&endpoint, POLL_INTERVAL * 5).await {
                Ok(version) => {
                    if let Some(ws_url) = version.web_socket_debugger_url {
                        return Ok(ws_url);
                    }
                }
                Err(e) => debug!("Endpoint {} not ready: {}", endpoint, e),
            }

            if started.elapsed() >= timeout {
                return Err(Error::timeout(format!(
                    "Browser on port {} not ready after {:?}",
                    self.port(),
                    timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Browser-level WebSocket URL
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    pub fn profile_dir(&self) -> &Path {
        self.profile.path()
    }

    /// Kill the browser and wait for it to exit
    pub async fn shutdown(mut self) -> Result<()> {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill browser on port {}: {}", self.port(), e);
            return Err(e.into());
        }
        info!("Browser on port {} stopped", self.port());
        Ok(())
    }
}
