mod common;

use std::time::Duration;

use anyhow::Result;
use serde_json::json;

use tenant_guard::actor::Role;
use tenant_guard::audit::AuditEntry;
use tenant_guard::types::Operation;

async fn wait_for_entries(h: &common::Harness, n: usize) -> Vec<AuditEntry> {
    for _ in 0..50 {
        let entries = h.store.audit_entries().await;
        if entries.len() >= n {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.store.audit_entries().await
}

#[tokio::test]
async fn mutations_are_audited_in_order() -> Result<()> {
    let h = common::Harness::new();
    let patient = h.actor(Role::Patient).await;

    let appointment = h.create(&patient, "appointments", json!({"status": "scheduled"})).await?;
    h.service
        .update(&patient, "appointments", appointment.id, json!({"notes": "fasting"}))
        .await?;
    h.service.delete(&patient, "appointments", appointment.id).await?;

    let entries = h.store.audit_entries().await;
    let ops: Vec<Operation> = entries.iter().map(|e| e.operation).collect();
    assert_eq!(ops, vec![Operation::Create, Operation::Update, Operation::Delete]);
    for entry in &entries {
        assert_eq!(entry.actor_id, patient.id);
        assert_eq!(entry.actor_role, Role::Patient);
        assert_eq!(entry.target_type, "appointments");
        assert_eq!(entry.target_id, Some(appointment.id));
    }
    assert_eq!(entries[1].detail, json!({"fields": ["notes"]}));
    Ok(())
}

#[tokio::test]
async fn audit_failure_does_not_change_the_outcome() -> Result<()> {
    let h = common::Harness::new();
    let patient = h.actor(Role::Patient).await;
    h.store.fail_audit(true);

    let appointment = h.create(&patient, "appointments", json!({"status": "scheduled"})).await?;
    let updated = h
        .service
        .update(&patient, "appointments", appointment.id, json!({"notes": "fasting"}))
        .await?;
    assert_eq!(updated.attributes.get("notes"), Some(&json!("fasting")));
    let read = h.service.get(&patient, "appointments", appointment.id).await?;
    assert_eq!(read.id, appointment.id);
    let deleted = h.service.delete(&patient, "appointments", appointment.id).await?;
    assert!(deleted.is_deleted());

    // Mutation is kept even though its audit row is missing
    assert!(h.store.get_raw("appointments", appointment.id).await.unwrap().is_deleted());
    assert!(h.store.audit_entries().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn sensitive_reads_are_audited_without_blocking() -> Result<()> {
    let h = common::Harness::new();
    let patient = h.actor(Role::Patient).await;
    let appointment = h.create(&patient, "appointments", json!({"status": "scheduled"})).await?;

    h.service.get(&patient, "appointments", appointment.id).await?;
    let entries = wait_for_entries(&h, 2).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].operation, Operation::Read);
    assert_eq!(entries[1].target_id, Some(appointment.id));
    Ok(())
}

#[tokio::test]
async fn unaudited_reads_write_nothing() -> Result<()> {
    let h = common::Harness::new();
    let member = h.actor(Role::Member).await;
    let pref = h
        .create(&member, "dashboard_preferences", json!({"attributes": {"dashboard_id": "sales"}}))
        .await?;

    h.service.get(&member, "dashboard_preferences", pref.id).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let entries = h.store.audit_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, Operation::Create);
    Ok(())
}

#[tokio::test]
async fn denied_operations_leave_no_audit_trail() -> Result<()> {
    let h = common::Harness::new();
    let owner = h.actor(Role::Patient).await;
    let intruder = h.actor(Role::Patient).await;
    let appointment = h.create(&owner, "appointments", json!({"status": "scheduled"})).await?;

    assert!(h.service.get(&intruder, "appointments", appointment.id).await.is_err());
    assert!(h.service.delete(&intruder, "appointments", appointment.id).await.is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.store.audit_entries().await.len(), 1);
    Ok(())
}

#[tokio::test]
async fn disabled_audit_records_nothing() -> Result<()> {
    let h = common::Harness::with_audit(false);
    let patient = h.actor(Role::Patient).await;
    let appointment = h.create(&patient, "appointments", json!({"status": "scheduled"})).await?;
    h.service.get(&patient, "appointments", appointment.id).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(h.store.audit_entries().await.is_empty());
    Ok(())
}
