use tracing::{debug, info, warn};

use super::ServiceBinding;
use crate::config::{AclsConfig, TimelineConfig};
use crate::metrics::ServiceMetrics;
use crate::timeline::client::TimelineClient;
use crate::timeline::{TimelineDomain, DOMAIN_ID_PREFIX};

/// Resolves the access-control domain entities will be posted under.
///
/// A predefined domain id wins outright; with ACLs disabled there is no
/// domain at all. Otherwise a domain derived from the application id is
/// registered with the server, and a registration failure downgrades to
/// posting without a domain rather than failing the service start.
pub(crate) async fn setup_domain<C: TimelineClient>(
    client: &C,
    timeline: &TimelineConfig,
    acls: &AclsConfig,
    binding: &ServiceBinding,
    metrics: &ServiceMetrics,
) -> Option<String> {
    if !timeline.domain.is_empty() {
        debug!(domain = %timeline.domain, "using predefined timeline domain");
        return Some(timeline.domain.clone());
    }

    if !acls.enabled {
        debug!("ACLs disabled, no timeline domain");
        return None;
    }

    let readers = join_principals(&binding.user, &[&acls.admin, &acls.modify, &acls.view]);
    let writers = join_principals(&binding.user, &[&acls.admin, &acls.modify]);
    let id = format!("{DOMAIN_ID_PREFIX}{}", binding.app_id);

    let domain = TimelineDomain {
        id: id.clone(),
        readers,
        writers,
    };

    match client.put_domain(&domain).await {
        Ok(()) => {
            info!(domain = %id, "timeline domain registered");
            Some(id)
        }
        Err(e) => {
            metrics.domain_put_failures.inc();
            warn!(domain = %id, error = %e, "domain registration failed, posting without a domain");
            None
        }
    }
}

/// Space-joined principal list: the current user first, then each ACL group
/// in order, with duplicates removed while preserving first occurrence.
fn join_principals(user: &str, groups: &[&Vec<String>]) -> String {
    let mut seen: Vec<&str> = Vec::new();

    if !user.is_empty() {
        seen.push(user);
    }

    for group in groups {
        for principal in group.iter() {
            if !principal.is_empty() && !seen.contains(&principal.as_str()) {
                seen.push(principal);
            }
        }
    }

    seen.join(" ")
}
