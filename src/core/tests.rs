#[cfg(test)]
mod tests_impl {
    use crate::core::error::Error;
    use crate::core::lifecycle::{DeleteStatus, EntryEffect, MutationStatus};
    use crate::core::resync::{ResyncStats, WatchExit};
    use std::time::Duration;
    use crate::core::rule::{NewRule, Protocol, RulePatch, RuleScope};
    use crate::core::store::{RuleFilter, RuleStore};
    use crate::core::test_helpers::{flaky_service, test_service};

    fn new_rule(vmid: u32, host_port: u16, container_port: u16) -> NewRule {
        NewRule {
            node: "n1".to_string(),
            vmid,
            host_port,
            container_port,
            protocol: Protocol::Tcp,
            description: None,
        }
    }

    #[tokio::test]
    async fn test_reference_scenario() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        locator.add_running("n1", 101, "10.0.0.6");

        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        assert_eq!(created.status, MutationStatus::Created);
        assert!(created.rule.enabled);
        assert_eq!(created.rule.container_ip_at_creation.to_string(), "10.0.0.5");
        assert_eq!(fake.lines().len(), 1);

        let err = service.create_rule(new_rule(101, 2222, 22)).await.unwrap_err();
        assert!(matches!(err, Error::PortConflict { host_port: 2222, protocol: Protocol::Tcp }));
        let (_, total) = service.store().list(&RuleFilter::all(), 0, 10).await.unwrap();
        assert_eq!(total, 1);

        fake.clear_calls();
        let patch = RulePatch {
            container_port: Some(2022),
            ..RulePatch::default()
        };
        let updated = service.update_rule(created.rule.id, patch).await.unwrap();

        let removes = fake.calls_with_action("-D");
        let adds = fake.calls_with_action("-A");
        assert_eq!(removes.len(), 1);
        assert_eq!(adds.len(), 1);
        assert!(removes[0].contains(&"10.0.0.5:22".to_string()));
        assert!(adds[0].contains(&"10.0.0.5:2022".to_string()));

        let calls = fake.calls();
        let remove_at = calls.iter().position(|c| c.contains(&"-D".to_string())).unwrap();
        let add_at = calls.iter().position(|c| c.contains(&"-A".to_string())).unwrap();
        assert!(remove_at < add_at);

        assert_eq!(updated.status, MutationStatus::Updated);
        assert!(updated.rule.enabled);
        assert_eq!(updated.rule.container_port, 2022);
        assert_eq!(fake.lines().len(), 1);
        assert!(fake.lines()[0].contains("10.0.0.5:2022"));
    }

    #[tokio::test]
    async fn test_create_unreachable_container_creates_nothing() {
        let (service, fake, _locator) = test_service();
        let err = service.create_rule(new_rule(100, 2222, 22)).await.unwrap_err();
        assert!(matches!(err, Error::ContainerUnreachable { vmid: 100, .. }));
        let (_, total) = service.store().list(&RuleFilter::all(), 0, 10).await.unwrap();
        assert_eq!(total, 0);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_stopped_container_creates_nothing() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        locator.set_status("n1", 100, "stopped");

        let err = service.create_rule(new_rule(100, 2222, 22)).await.unwrap_err();
        assert!(matches!(err, Error::ContainerNotRunning { ref status, .. } if status == "stopped"));
        let (_, total) = service.store().list(&RuleFilter::all(), 0, 10).await.unwrap();
        assert_eq!(total, 0);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_input() {
        let (service, _fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");

        let err = service.create_rule(new_rule(100, 0, 22)).await.unwrap_err();
        assert!(matches!(err, Error::Validation { ref field, .. } if field == "host_port"));

        let mut bad_node = new_rule(100, 2222, 22);
        bad_node.node = "n1/../x".to_string();
        assert!(matches!(
            service.create_rule(bad_node).await,
            Err(Error::Validation { .. })
        ));

        assert!(matches!(
            service.create_rule(new_rule(42, 2222, 22)).await,
            Err(Error::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_with_failing_apply_persists_disabled_row() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        fake.set_fail_adds(true);

        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        assert_eq!(created.status, MutationStatus::CreatedButFirewallFailed);
        assert!(created.status.is_degraded());
        assert!(!created.rule.enabled);
        assert!(created.new_entry.is_failed());
        assert!(created.message.contains("disabled"));

        let stored = service.get_rule(created.rule.id).await.unwrap();
        assert!(!stored.enabled);
        assert!(fake.lines().is_empty());

        // The disabled row does not hold the slot
        fake.set_fail_adds(false);
        locator.add_running("n1", 101, "10.0.0.6");
        let other = service.create_rule(new_rule(101, 2222, 22)).await.unwrap();
        assert_eq!(other.status, MutationStatus::Created);
    }

    #[tokio::test]
    async fn test_create_reports_failed_disable() {
        let (service, fake, locator) = flaky_service();
        locator.add_running("n1", 100, "10.0.0.5");
        fake.set_fail_adds(true);
        service.store().set_fail_updates(true);

        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        assert_eq!(created.status, MutationStatus::CreatedButFirewallFailed);
        assert!(created.message.contains("Disabling the rule failed"));
    }

    #[tokio::test]
    async fn test_protocols_do_not_collide() {
        let (service, _fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");

        service.create_rule(new_rule(100, 53, 53)).await.unwrap();
        let mut udp = new_rule(100, 53, 53);
        udp.protocol = Protocol::Udp;
        let created = service.create_rule(udp).await.unwrap();
        assert_eq!(created.status, MutationStatus::Created);
    }

    #[tokio::test]
    async fn test_description_only_update_touches_no_firewall() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        fake.clear_calls();

        let patch = RulePatch {
            description: Some("ssh for alice".to_string()),
            ..RulePatch::default()
        };
        let updated = service.update_rule(created.rule.id, patch).await.unwrap();

        assert!(fake.calls().is_empty());
        assert_eq!(updated.status, MutationStatus::Updated);
        assert_eq!(updated.old_entry, EntryEffect::NotAttempted);
        assert_eq!(updated.new_entry, EntryEffect::NotAttempted);
        assert_eq!(updated.rule.description.as_deref(), Some("ssh for alice"));
    }

    #[tokio::test]
    async fn test_host_port_change_failing_apply_disables_and_reports_removal() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        fake.clear_calls();
        fake.fail_adds_for_port(3333);

        let patch = RulePatch {
            host_port: Some(3333),
            ..RulePatch::default()
        };
        let updated = service.update_rule(created.rule.id, patch).await.unwrap();

        assert_eq!(fake.calls_with_action("-D").len(), 1);
        assert_eq!(fake.calls_with_action("-A").len(), 1);
        assert!(fake.calls_with_action("-D")[0].contains(&"2222".to_string()));
        assert_eq!(updated.status, MutationStatus::UpdatedButFirewallFailed);
        assert!(!updated.rule.enabled);
        assert_eq!(updated.rule.host_port, 3333);
        assert_eq!(updated.old_entry, EntryEffect::Done);
        assert!(updated.message.contains("Old entry removal: succeeded"));
        assert!(fake.lines().is_empty());
    }

    #[tokio::test]
    async fn test_update_into_taken_slot_is_rejected_without_side_effects() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        service.create_rule(new_rule(100, 80, 80)).await.unwrap();
        let second = service.create_rule(new_rule(100, 8080, 80)).await.unwrap();
        fake.clear_calls();

        let patch = RulePatch {
            host_port: Some(80),
            ..RulePatch::default()
        };
        let err = service.update_rule(second.rule.id, patch).await.unwrap_err();
        assert!(err.is_port_conflict());
        assert!(fake.calls().is_empty());
        assert_eq!(service.get_rule(second.rule.id).await.unwrap().host_port, 8080);
    }

    #[tokio::test]
    async fn test_disable_removes_entry_and_enable_reapplies_with_fresh_ip() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        let id = created.rule.id;

        let disabled = service
            .update_rule(id, RulePatch { enabled: Some(false), ..RulePatch::default() })
            .await
            .unwrap();
        assert_eq!(disabled.status, MutationStatus::Updated);
        assert_eq!(disabled.old_entry, EntryEffect::Done);
        assert!(!disabled.rule.enabled);
        assert!(fake.lines().is_empty());

        locator.set_ip("n1", 100, Some("10.0.0.9"));
        fake.clear_calls();
        let enabled = service
            .update_rule(id, RulePatch { enabled: Some(true), ..RulePatch::default() })
            .await
            .unwrap();
        assert_eq!(enabled.status, MutationStatus::Updated);
        assert_eq!(enabled.rule.container_ip_at_creation.to_string(), "10.0.0.9");
        assert!(fake.calls_with_action("-D").is_empty());
        assert_eq!(fake.calls_with_action("-A").len(), 1);
        assert!(fake.lines()[0].contains("10.0.0.9:22"));

        // The refreshed IP was persisted, so a later removal matches the live entry
        service.delete_rule(id).await.unwrap();
        assert!(fake.lines().is_empty());
    }

    #[tokio::test]
    async fn test_reenable_checks_the_slot() {
        let (service, _fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        locator.add_running("n1", 101, "10.0.0.6");

        let first = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        service
            .update_rule(first.rule.id, RulePatch { enabled: Some(false), ..RulePatch::default() })
            .await
            .unwrap();
        service.create_rule(new_rule(101, 2222, 22)).await.unwrap();

        let err = service
            .update_rule(first.rule.id, RulePatch { enabled: Some(true), ..RulePatch::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PortConflict { .. }));
        assert!(!service.get_rule(first.rule.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_reenable_with_unreachable_container() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        let id = created.rule.id;
        service
            .update_rule(id, RulePatch { enabled: Some(false), ..RulePatch::default() })
            .await
            .unwrap();

        locator.set_ip("n1", 100, None);
        fake.clear_calls();
        let result = service
            .update_rule(id, RulePatch { enabled: Some(true), ..RulePatch::default() })
            .await
            .unwrap();
        assert_eq!(result.status, MutationStatus::UpdatedButIpUnavailable);
        assert!(!result.rule.enabled);
        assert!(fake.calls().is_empty());
        assert!(!service.get_rule(id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_update_reports_failed_old_entry_removal() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        fake.set_fail_removes(true);

        let updated = service
            .update_rule(
                created.rule.id,
                RulePatch { container_port: Some(2022), ..RulePatch::default() },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, MutationStatus::Updated);
        assert!(updated.old_entry.is_failed());
        assert!(updated.message.contains("manual cleanup"));
    }

    #[tokio::test]
    async fn test_failed_update_commit_restores_old_entry() {
        let (service, fake, locator) = flaky_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        let before = fake.lines();
        service.store().set_fail_updates(true);

        let err = service
            .update_rule(created.rule.id, RulePatch { host_port: Some(3333), ..RulePatch::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(fake.lines(), before);
        assert_eq!(service.get_rule(created.rule.id).await.unwrap().host_port, 2222);
    }

    #[tokio::test]
    async fn test_create_losing_slot_at_commit_creates_nothing() {
        let (service, fake, locator) = flaky_service();
        locator.add_running("n1", 100, "10.0.0.5");
        service.store().claim_slot_before_next_write(2222);

        let err = service.create_rule(new_rule(100, 2222, 22)).await.unwrap_err();
        assert!(matches!(err, Error::StoreConflict { host_port: 2222, protocol: Protocol::Tcp }));
        assert!(err.is_port_conflict());

        let page = service.list_rules(&RuleScope::All, 0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.rules[0].node, "rival");
        assert!(fake.calls_with_action("-A").is_empty());
        assert!(fake.lines().is_empty());
    }

    #[tokio::test]
    async fn test_update_losing_slot_at_commit_restores_old_entry() {
        let (service, fake, locator) = flaky_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        let before = fake.lines();
        service.store().claim_slot_before_next_write(3333);

        let err = service
            .update_rule(created.rule.id, RulePatch { host_port: Some(3333), ..RulePatch::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreConflict { host_port: 3333, .. }));
        assert!(err.is_port_conflict());

        // Old entry was removed for the move, then put back
        assert_eq!(fake.calls_with_action("-D").len(), 1);
        assert_eq!(fake.lines(), before);
        let stored = service.get_rule(created.rule.id).await.unwrap();
        assert_eq!(stored.host_port, 2222);
        assert!(stored.enabled);
    }

    #[tokio::test]
    async fn test_update_missing_rule() {
        let (service, _fake, _locator) = test_service();
        let err = service.update_rule(99, RulePatch::default()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(99)));
    }

    #[tokio::test]
    async fn test_delete_disabled_rule_issues_no_commands() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        fake.set_fail_adds(true);
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        assert!(!created.rule.enabled);
        fake.clear_calls();

        let deletion = service.delete_rule(created.rule.id).await.unwrap();
        assert_eq!(deletion.status, DeleteStatus::RemovedWasDisabled);
        assert!(fake.calls().is_empty());
        assert!(matches!(
            service.get_rule(created.rule.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_with_failing_removal_still_deletes_row() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        fake.set_fail_removes(true);

        let deletion = service.delete_rule(created.rule.id).await.unwrap();
        assert_eq!(deletion.status, DeleteStatus::RemovedEntryCleanupFailed);
        assert!(deletion.message.contains("manual cleanup may be needed"));
        assert!(service.get_rule(created.rule.id).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_enabled_rule_removes_entry() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();

        let deletion = service.delete_rule(created.rule.id).await.unwrap();
        assert_eq!(deletion.status, DeleteStatus::RemovedWithEntry);
        assert!(fake.lines().is_empty());
        assert!(matches!(service.delete_rule(created.rule.id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_delete_commit_restores_entry() {
        let (service, fake, locator) = flaky_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        service.store().set_fail_deletes(true);

        assert!(service.delete_rule(created.rule.id).await.is_err());
        assert_eq!(fake.lines().len(), 1);
        assert!(service.get_rule(created.rule.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_list_scopes_and_clamps() {
        let (service, _fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        locator.add_running("n1", 101, "10.0.0.6");
        for port in 1000..1005 {
            service.create_rule(new_rule(100, port, 80)).await.unwrap();
        }
        service.create_rule(new_rule(101, 2000, 80)).await.unwrap();

        let page = service.list_rules(&RuleScope::All, 0, 0).await.unwrap();
        assert_eq!(page.rules.len(), 1);
        assert_eq!(page.total, 6);
        assert_eq!(page.rules[0].host_port, 2000);

        let scoped = RuleScope::Container { node: "n1".to_string(), vmid: 100 };
        let page = service.list_rules(&scoped, 3, 100).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.rules.len(), 2);
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        locator.add_running("n1", 101, "10.0.0.6");
        service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        service.create_rule(new_rule(101, 8080, 80)).await.unwrap();
        fake.seed_line("-A PREROUTING -p tcp -m tcp --dport 443 -j DNAT --to-destination 192.168.1.2:443");

        let first = service.resync_all().await;
        let second = service.resync_all().await;

        assert!(first.ok && second.ok);
        assert_eq!(first.stats.cleared_rules, 2);
        assert_eq!(first.stats, second.stats);
        assert_eq!(second.stats.applied_rules, 2);
        assert_eq!(second.stats.failed_to_apply_rules, 0);
        assert!(second.stats.rules_disabled_due_to_error_ids.is_empty());

        // The foreign entry is never touched
        let lines = fake.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().any(|l| l.contains("192.168.1.2:443")));
    }

    #[tokio::test]
    async fn test_resync_disables_unreachable_containers_without_applying() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        locator.add_running("n1", 101, "10.0.0.6");
        let keep = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        let lost = service.create_rule(new_rule(101, 8080, 80)).await.unwrap();

        locator.set_ip("n1", 101, None);
        fake.clear_calls();
        let report = service.resync_all().await;

        assert!(report.ok);
        assert_eq!(report.stats.rules_disabled_due_to_error_ids, vec![lost.rule.id]);
        assert_eq!(report.stats.applied_rules, 1);
        assert!(
            fake.calls_with_action("-A")
                .iter()
                .all(|argv| !argv.contains(&"8080".to_string()))
        );
        assert!(!service.get_rule(lost.rule.id).await.unwrap().enabled);
        assert!(service.get_rule(keep.rule.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_resync_refreshes_moved_containers() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();

        locator.set_ip("n1", 100, Some("10.0.0.77"));
        let report = service.resync_all().await;

        assert!(report.ok);
        assert_eq!(report.stats.applied_rules, 1);
        assert_eq!(
            service.get_rule(created.rule.id).await.unwrap().container_ip_at_creation.to_string(),
            "10.0.0.77"
        );
        assert_eq!(fake.lines().len(), 1);
        assert!(fake.lines()[0].contains("10.0.0.77:22"));
    }

    #[tokio::test]
    async fn test_resync_disables_rules_that_fail_to_apply() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let ok = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        let bad = service.create_rule(new_rule(100, 3333, 33)).await.unwrap();

        fake.fail_adds_for_port(3333);
        let report = service.resync_all().await;

        assert!(report.ok);
        assert_eq!(report.stats.failed_to_apply_rules, 1);
        assert_eq!(report.stats.applied_rules, 1);
        assert_eq!(report.stats.rules_disabled_due_to_error_ids, vec![bad.rule.id]);
        assert!(service.get_rule(ok.rule.id).await.unwrap().enabled);
        assert!(!service.get_rule(bad.rule.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_resync_counts_clear_failures_and_continues() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        fake.seed_line(
            "-A PREROUTING -p tcp --dport 1 -m comment --comment \"pve-nat:id=77;node=n1;vmid=100\" -j DNAT --to-destination 10.0.0.1:1",
        );
        fake.seed_line("-A PREROUTING -m comment --comment \"pve-nat:id=78 -j ACCEPT");
        fake.set_fail_removes(true);

        let report = service.resync_all().await;
        assert!(report.ok);
        assert_eq!(report.stats.failed_to_clear_rules, 2);
        assert_eq!(report.stats.cleared_rules, 0);
        assert_eq!(report.stats.skipped_lines, 1);
        assert_eq!(report.stats.applied_rules, 1);
    }

    #[tokio::test]
    async fn test_resync_aborts_when_chain_cannot_be_listed() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        let created = service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        locator.set_ip("n1", 100, None);
        fake.set_fail_list(true);
        fake.clear_calls();

        let report = service.resync_all().await;
        assert!(!report.ok);
        assert_eq!(report.stats, ResyncStats::default());
        assert_eq!(fake.calls().len(), 1);
        assert!(service.get_rule(created.rule.id).await.unwrap().enabled);
    }

    #[tokio::test]
    async fn test_resync_commit_failure_still_reports_counts() {
        let (service, fake, locator) = flaky_service();
        locator.add_running("n1", 100, "10.0.0.5");
        service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        locator.set_ip("n1", 100, Some("10.0.0.8"));
        service.store().set_fail_amend_many(true);

        let report = service.resync_all().await;
        assert!(!report.ok);
        assert_eq!(report.stats.cleared_rules, 1);
        assert_eq!(report.stats.applied_rules, 1);
        assert!(report.message.contains("partially"));
        assert_eq!(fake.lines().len(), 1);
    }

    #[tokio::test]
    async fn test_resync_is_single_flight() {
        let (service, _fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        service.create_rule(new_rule(100, 2222, 22)).await.unwrap();

        let _held = service.resync_gate.try_lock().unwrap();
        let report = service.resync_all().await;
        assert!(!report.ok);
        assert!(report.message.contains("already running"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_runs_passes_until_shutdown() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        service.create_rule(new_rule(100, 2222, 22)).await.unwrap();

        let mut passes = 0;
        let exit = service
            .watch(
                Duration::from_secs(10),
                tokio::time::sleep(Duration::from_secs(25)),
                async |report| {
                    assert!(report.ok);
                    passes += 1;
                },
            )
            .await;

        assert_eq!(exit, WatchExit::Stopped);
        // Ticks at 0s, 10s and 20s
        assert_eq!(passes, 3);
        assert_eq!(fake.lines().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_shutdown_interrupts_a_running_pass() {
        let (service, fake, locator) = test_service();
        locator.add_running("n1", 100, "10.0.0.5");
        service.create_rule(new_rule(100, 2222, 22)).await.unwrap();
        fake.set_delay(Duration::from_secs(60));

        let mut passes = 0;
        let exit = service
            .watch(
                Duration::from_secs(10),
                tokio::time::sleep(Duration::from_secs(5)),
                async |_report| passes += 1,
            )
            .await;

        assert_eq!(exit, WatchExit::Interrupted);
        assert_eq!(passes, 0);
        // The gate was released with the dropped pass
        assert!(service.resync_gate.try_lock().is_ok());
    }
}
