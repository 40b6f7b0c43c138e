// src/reconcile/apps.rs

//! Application queue construction
//!
//! Removals are always queued ahead of installs, keeping document order
//! within each group. That ordering is what makes a planned downgrade work:
//! the server lists a removal of the installed version and an install of the
//! older one, and the removal has to run first.
//!
//! Version equality here means equality of digit projections, see
//! [`crate::version`].

use super::queue::ReconciliationQueue;
use crate::model::AppSpec;
use crate::version::{compare_versions, is_any_version, versions_equal_ignoring_letters};
use std::cmp::Ordering;
use tracing::{debug, info};

/// Live view of installed packages
pub trait InstalledProbe {
    /// Version name of an installed package, `None` when not installed
    fn installed_version(&self, package_id: &str) -> Option<String>;
}

/// Why an application spec was or was not queued
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppDecision {
    /// Installed at the targeted version, remove it
    Remove,
    /// Not installed yet
    Install,
    /// Installed at an older version
    Upgrade { installed: String },
    /// Installed at a newer version that is also scheduled for removal
    Downgrade { installed: String },
    /// Not an installable package (web link, intent, ...)
    NotApplication,
    /// No URL: a preinstalled system package
    NoSource,
    /// Removal requested but the package is not installed
    NotInstalled,
    /// Removal targets a version other than the installed one
    VersionMismatch { installed: String },
    /// Installed version already satisfies the spec
    Satisfied { installed: String },
    /// Newer version installed and nothing plans to remove it
    DowngradeRefused { installed: String },
}

impl AppDecision {
    pub fn is_queued(&self) -> bool {
        matches!(
            self,
            Self::Remove | Self::Install | Self::Upgrade { .. } | Self::Downgrade { .. }
        )
    }
}

/// Decide what to do with a single spec given the full desired list
fn decide_app<P>(spec: &AppSpec, desired: &[AppSpec], probe: &P) -> AppDecision
where
    P: InstalledProbe + ?Sized,
{
    if !spec.is_application() {
        return AppDecision::NotApplication;
    }

    if !spec.remove && spec.url().is_none() {
        return AppDecision::NoSource;
    }

    let Some(installed) = probe.installed_version(&spec.package_id) else {
        return if spec.remove {
            AppDecision::NotInstalled
        } else {
            AppDecision::Install
        };
    };

    if spec.remove {
        if !is_any_version(&spec.version)
            && !versions_equal_ignoring_letters(&installed, &spec.version)
        {
            return AppDecision::VersionMismatch { installed };
        }
        return AppDecision::Remove;
    }

    if spec.skip_version_check
        || is_any_version(&spec.version)
        || versions_equal_ignoring_letters(&installed, &spec.version)
    {
        return AppDecision::Satisfied { installed };
    }

    if compare_versions(&installed, &spec.version) == Ordering::Greater {
        let removal_planned = desired.iter().any(|other| {
            other.remove
                && other.package_id.eq_ignore_ascii_case(&spec.package_id)
                && versions_equal_ignoring_letters(&installed, &other.version)
        });

        return if removal_planned {
            info!(
                "Current version {} of {} will be removed, downgrade to {} allowed",
                installed, spec.package_id, spec.version
            );
            AppDecision::Downgrade { installed }
        } else {
            info!(
                "Ignoring downgrade request for {}: installed {}, requested {}",
                spec.package_id, installed, spec.version
            );
            AppDecision::DowngradeRefused { installed }
        };
    }

    AppDecision::Upgrade { installed }
}

/// Every spec paired with its decision, removals first then installs
pub fn plan_apps<P>(desired: &[AppSpec], probe: &P) -> Vec<(AppSpec, AppDecision)>
where
    P: InstalledProbe + ?Sized,
{
    let removals = desired.iter().filter(|a| a.remove);
    let installs = desired.iter().filter(|a| !a.remove);

    removals
        .chain(installs)
        .map(|spec| {
            let decision = decide_app(spec, desired, probe);
            debug!("App {}: {:?}", spec.package_id, decision);
            (spec.clone(), decision)
        })
        .collect()
}

/// Build the queue of application operations for one pass
pub fn build_app_queue<P>(desired: &[AppSpec], probe: &P) -> ReconciliationQueue<AppSpec>
where
    P: InstalledProbe + ?Sized,
{
    plan_apps(desired, probe)
        .into_iter()
        .filter(|(_, decision)| decision.is_queued())
        .map(|(spec, _)| spec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Installed(HashMap<String, String>);

    impl InstalledProbe for Installed {
        fn installed_version(&self, package_id: &str) -> Option<String> {
            self.0.get(package_id).cloned()
        }
    }

    fn installed(pairs: &[(&str, &str)]) -> Installed {
        Installed(
            pairs
                .iter()
                .map(|(p, v)| (p.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn install(pkg: &str, version: &str) -> AppSpec {
        AppSpec::install(pkg, version, format!("https://mdm.example.com/files/{}.apk", pkg))
    }

    fn summary(queue: &ReconciliationQueue<AppSpec>) -> Vec<(String, bool, String)> {
        queue
            .iter()
            .map(|a| (a.package_id.clone(), a.remove, a.version.clone()))
            .collect()
    }

    #[test]
    fn test_removal_before_install_for_same_package() {
        let desired = vec![AppSpec::removal("pkgA", "2.0"), install("pkgA", "3.0")];
        let queue = build_app_queue(&desired, &installed(&[("pkgA", "2.0")]));

        assert_eq!(
            summary(&queue),
            vec![
                ("pkgA".to_string(), true, "2.0".to_string()),
                ("pkgA".to_string(), false, "3.0".to_string()),
            ]
        );
    }

    #[test]
    fn test_removals_grouped_first() {
        let desired = vec![
            install("one", "1.0"),
            AppSpec::removal("two", "0"),
            install("three", "1.0"),
            AppSpec::removal("four", "0"),
        ];
        let probe = installed(&[("two", "5"), ("four", "1")]);
        let queue = build_app_queue(&desired, &probe);

        let order: Vec<_> = queue.iter().map(|a| a.package_id.as_str()).collect();
        assert_eq!(order, vec!["two", "four", "one", "three"]);
    }

    #[test]
    fn test_downgrade_refused_without_removal() {
        let desired = vec![install("pkgB", "2.0")];
        let queue = build_app_queue(&desired, &installed(&[("pkgB", "3.0")]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_downgrade_allowed_when_current_version_removed() {
        let desired = vec![AppSpec::removal("PKGB", "3.0-release"), install("pkgB", "2.0")];
        let plan = plan_apps(&desired, &installed(&[("pkgB", "3.0"), ("PKGB", "3.0")]));

        assert_eq!(plan[0].1, AppDecision::Remove);
        assert_eq!(
            plan[1].1,
            AppDecision::Downgrade {
                installed: "3.0".into()
            }
        );
    }

    #[test]
    fn test_removal_of_missing_package_dropped() {
        let desired = vec![AppSpec::removal("ghost", "0")];
        assert!(build_app_queue(&desired, &installed(&[])).is_empty());
    }

    #[test]
    fn test_removal_of_other_version_dropped() {
        let desired = vec![AppSpec::removal("pkg", "1.0")];
        let plan = plan_apps(&desired, &installed(&[("pkg", "1.1")]));
        assert_eq!(
            plan[0].1,
            AppDecision::VersionMismatch {
                installed: "1.1".into()
            }
        );
    }

    #[test]
    fn test_removal_any_version() {
        let desired = vec![AppSpec::removal("pkg", "0")];
        let queue = build_app_queue(&desired, &installed(&[("pkg", "7.3")]));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_install_satisfied() {
        let mut skip = install("skip", "9.9");
        skip.skip_version_check = true;
        let desired = vec![
            install("same", "1.2.3"),
            install("lettered", "1.2.3"),
            install("any", "0"),
            skip,
        ];
        let probe = installed(&[
            ("same", "1.2.3"),
            ("lettered", "1.2.3-beta"),
            ("any", "0.1"),
            ("skip", "1.0"),
        ]);

        assert!(build_app_queue(&desired, &probe).is_empty());
    }

    #[test]
    fn test_upgrade_and_fresh_install_kept() {
        let desired = vec![install("old", "2.0"), install("new", "1.0")];
        let plan = plan_apps(&desired, &installed(&[("old", "1.9")]));

        assert_eq!(
            plan[0].1,
            AppDecision::Upgrade {
                installed: "1.9".into()
            }
        );
        assert_eq!(plan[1].1, AppDecision::Install);
    }

    #[test]
    fn test_non_application_and_system_apps_excluded() {
        let mut web = install("link", "1");
        web.app_type = Some("web".into());
        let mut system = install("system", "1");
        system.url = None;

        let plan = plan_apps(&[web, system], &installed(&[]));
        assert_eq!(plan[0].1, AppDecision::NotApplication);
        assert_eq!(plan[1].1, AppDecision::NoSource);
        assert!(plan.iter().all(|(_, d)| !d.is_queued()));
    }
}
