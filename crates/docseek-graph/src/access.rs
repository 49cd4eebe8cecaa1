use std::sync::Arc;

use tracing::{debug, error};

use crate::executor::ResilientExecutor;
use crate::graph_url;
use crate::http::BearerAuth;
use crate::models::{Page, Permission, ScopeTag};

/// Checks whether a user may read a file by scanning its permission listings.
pub struct AccessVerifier {
    executor: Arc<ResilientExecutor>,
    base_url: String,
}

impl AccessVerifier {
    pub fn new(executor: Arc<ResilientExecutor>, base_url: &str) -> Self {
        Self {
            executor,
            base_url: base_url.to_string(),
        }
    }

    /// Looks at the caller's drive, then the named user's drive, then the
    /// owning site's drive for site-scoped files. A permission grants access
    /// when its grantee is the user (or nobody in particular) and one of its
    /// roles is read, view or write. Failed listings count as no match.
    pub async fn has_access(
        &self,
        auth: &BearerAuth,
        file_id: &str,
        user_email: &str,
        scope: &ScopeTag,
    ) -> bool {
        let mut endpoints: Vec<Vec<&str>> = vec![
            vec!["me", "drive", "items", file_id, "permissions"],
            vec!["users", user_email, "drive", "items", file_id, "permissions"],
        ];
        if let Some(site_id) = scope.site_id() {
            endpoints.push(vec!["sites", site_id, "drive", "items", file_id, "permissions"]);
        }

        for segments in endpoints {
            let url = match graph_url(&self.base_url, &segments) {
                Ok(url) => url,
                Err(err) => {
                    error!("Permission check error: {}", err);
                    continue;
                }
            };
            match self.executor.get_json::<Page<Permission>>(&url, auth).await {
                Ok(page) => {
                    let granted = page
                        .value
                        .iter()
                        .map(Permission::canonical)
                        .any(|grant| grant.applies_to(user_email) && grant.allows_read());
                    if granted {
                        debug!("{} may read {} via {}", user_email, file_id, url);
                        return true;
                    }
                }
                Err(err) => error!("Permission check error on {}: {}", url, err),
            }
        }
        false
    }
}
