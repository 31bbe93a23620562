use crate::http::method::Method;
use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub code: u16,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiMapping {
    /// Extension including the leading dot, e.g. `.py`.
    pub extension: String,
    /// `None` runs the script itself.
    pub interpreter: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Location {
    pub prefix: String,
    /// `None` means every implemented method is allowed.
    pub methods: Option<Vec<Method>>,
    pub root: PathBuf,
    pub index: Vec<String>,
    pub autoindex: bool,
    pub client_max_body_size: usize,
    pub redirect: Option<Redirect>,
    pub cgi: Vec<CgiMapping>,
    pub upload_dir: Option<PathBuf>,
}

impl Location {
    pub fn allows(&self, method: &Method) -> bool {
        match (&self.methods, method) {
            (_, Method::Other(_)) => false,
            (None, _) => true,
            (Some(list), m) => list.contains(m),
        }
    }

    /// The CGI mapping whose extension ends `file_name`, if any.
    pub fn cgi_for(&self, file_name: &str) -> Option<&CgiMapping> {
        self.cgi
            .iter()
            .find(|m| file_name.len() > m.extension.len() && file_name.ends_with(&m.extension))
    }

    /// Upload directory with relative paths resolved under `root`.
    pub fn upload_path(&self) -> Option<PathBuf> {
        let dir = self.upload_dir.as_ref()?;
        if dir.is_absolute() {
            Some(dir.clone())
        } else {
            Some(self.root.join(dir))
        }
    }
}

#[derive(Debug, Clone)]
pub struct VirtualHost {
    pub host: String,
    pub port: u16,
    pub server_names: Vec<String>,
    pub client_max_body_size: usize,
    pub error_pages: HashMap<u16, PathBuf>,
    pub locations: Vec<Location>,
}

impl VirtualHost {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn answers_to(&self, name: &str) -> bool {
        self.server_names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<VirtualHost>,
    pub timeout_seconds: u64,
    pub cgi_timeout_seconds: u64,
}
