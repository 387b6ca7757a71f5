//! Read-only commands: query, counts, info

use anyhow::{Context, Result};
use beacon_store::StorageCoordinator;
use beacon_types::{EntityKind, QueryFilter, Severity};

/// At most one of the filter flags may be set; clap enforces that
pub fn filter(
    url: Option<String>,
    severity: Option<String>,
    domain: Option<String>,
) -> Result<Option<QueryFilter>> {
    if let Some(url) = url {
        return Ok(Some(QueryFilter::Url(url)));
    }
    if let Some(severity) = severity {
        let severity: Severity = severity.parse().context("Invalid --severity")?;
        return Ok(Some(QueryFilter::Severity(severity)));
    }
    Ok(domain.map(QueryFilter::Domain))
}

pub async fn query(
    coordinator: &StorageCoordinator,
    kind: EntityKind,
    filter: Option<QueryFilter>,
    limit: usize,
    offset: usize,
) -> Result<()> {
    let page = match filter {
        Some(filter) => coordinator.query_filtered(kind, filter, limit, offset).await?,
        None => coordinator.query(kind, limit, offset).await?,
    };
    super::print_json(&page)
}

pub async fn counts(coordinator: &StorageCoordinator) -> Result<()> {
    let counts = coordinator.get_counts().await?;
    super::print_json(&counts)
}

pub async fn info(coordinator: &StorageCoordinator) -> Result<()> {
    let info = coordinator.get_backend_info().await?;
    super::print_json(&info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_flags() {
        assert_eq!(filter(None, None, None).unwrap(), None);
        assert_eq!(
            filter(None, Some("warn".into()), None).unwrap(),
            Some(QueryFilter::Severity(Severity::Warn))
        );
        assert_eq!(
            filter(None, None, Some("cdn.example.com".into())).unwrap(),
            Some(QueryFilter::Domain("cdn.example.com".into()))
        );
        assert!(filter(None, Some("fatal".into()), None).is_err());
    }
}
