//! Backend URLs: `local://[/path]`, `ssh://[user@]host[:port]/path`,
//! `pbs|slurm|sge|queue://[[user@]host[:port]]/path`.
//!
//! A queue URL without a host drives the scheduler on this machine.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheme {
    Local,
    Ssh,
    /// Scheduler name, `None` for `queue://` (detect on the worker).
    Queue(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendUrl {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Worker-side base directory. `None` = a fresh temporary directory.
    pub remote_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("{0:?} is not a backend url (missing ://)")]
    MissingScheme(String),
    #[error("unsupported backend scheme {0:?}")]
    UnknownScheme(String),
    #[error("backend url {0:?} needs a host")]
    MissingHost(String),
    #[error("invalid port in {0:?}")]
    BadPort(String),
}

impl BackendUrl {
    pub fn is_queue(&self) -> bool {
        matches!(self.scheme, Scheme::Queue(_))
    }
}

impl FromStr for BackendUrl {
    type Err = UrlError;

    fn from_str(url: &str) -> Result<Self, UrlError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| UrlError::MissingScheme(url.to_string()))?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "local" => Scheme::Local,
            "ssh" => Scheme::Ssh,
            "queue" => Scheme::Queue(None),
            "pbs" | "pbspro" => Scheme::Queue(Some("pbspro".into())),
            "torque" => Scheme::Queue(Some("torque".into())),
            "slurm" => Scheme::Queue(Some("slurm".into())),
            "sge" => Scheme::Queue(Some("sge".into())),
            other => return Err(UrlError::UnknownScheme(other.to_string())),
        };

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let remote_path = (!path.is_empty() && path != "/").then(|| path.to_string());

        if scheme == Scheme::Local {
            return Ok(Self {
                scheme,
                user: None,
                host: None,
                port: None,
                remote_path,
            });
        }

        let (user, hostport) = match authority.rsplit_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, authority),
        };
        let (host, port) = match hostport.rsplit_once(':') {
            Some((host, port)) => (
                host,
                Some(port.parse().map_err(|_| UrlError::BadPort(url.to_string()))?),
            ),
            None => (hostport, None),
        };
        if host.is_empty() {
            if matches!(scheme, Scheme::Queue(_)) && user.is_none() && port.is_none() {
                return Ok(Self {
                    scheme,
                    user: None,
                    host: None,
                    port: None,
                    remote_path,
                });
            }
            return Err(UrlError::MissingHost(url.to_string()));
        }
        Ok(Self {
            scheme,
            user,
            host: Some(host.to_string()),
            port,
            remote_path,
        })
    }
}

impl fmt::Display for BackendUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match &self.scheme {
            Scheme::Local => "local",
            Scheme::Ssh => "ssh",
            Scheme::Queue(None) => "queue",
            Scheme::Queue(Some(name)) => name.as_str(),
        };
        write!(f, "{scheme}://")?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        if let Some(host) = &self.host {
            write!(f, "{host}")?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(path) = &self.remote_path {
            write!(f, "{path}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_url_with_everything() {
        let url: BackendUrl = "ssh://fit@cluster.example:2222/scratch/runs".parse().unwrap();
        assert_eq!(url.scheme, Scheme::Ssh);
        assert_eq!(url.user.as_deref(), Some("fit"));
        assert_eq!(url.host.as_deref(), Some("cluster.example"));
        assert_eq!(url.port, Some(2222));
        assert_eq!(url.remote_path.as_deref(), Some("/scratch/runs"));
        assert_eq!(url.to_string(), "ssh://fit@cluster.example:2222/scratch/runs");
    }

    #[test]
    fn local_url_path_is_optional() {
        let bare: BackendUrl = "local://".parse().unwrap();
        assert_eq!(bare.remote_path, None);
        let rooted: BackendUrl = "local:///tmp/work".parse().unwrap();
        assert_eq!(rooted.remote_path.as_deref(), Some("/tmp/work"));
    }

    #[test]
    fn scheduler_schemes_map_to_backends() {
        let pbs: BackendUrl = "pbs://hpc/home/me".parse().unwrap();
        assert_eq!(pbs.scheme, Scheme::Queue(Some("pbspro".into())));
        let auto: BackendUrl = "queue://hpc".parse().unwrap();
        assert_eq!(auto.scheme, Scheme::Queue(None));
        assert!(auto.is_queue());
        let here: BackendUrl = "slurm:///scratch/fits".parse().unwrap();
        assert_eq!(here.host, None);
        assert_eq!(here.remote_path.as_deref(), Some("/scratch/fits"));
        assert_eq!(here.to_string(), "slurm:///scratch/fits");
    }

    #[test]
    fn malformed_urls_are_rejected() {
        assert!(matches!("hpc:/x".parse::<BackendUrl>(), Err(UrlError::MissingScheme(_))));
        assert!(matches!("ftp://hpc".parse::<BackendUrl>(), Err(UrlError::UnknownScheme(_))));
        assert!(matches!("ssh:///path".parse::<BackendUrl>(), Err(UrlError::MissingHost(_))));
        assert!(matches!("ssh://h:port/".parse::<BackendUrl>(), Err(UrlError::BadPort(_))));
    }
}
