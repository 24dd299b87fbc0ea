mod common;

use anyhow::Result;
use serde_json::json;

use tenant_guard::actor::Role;
use tenant_guard::query::ListParams;
use tenant_guard::GuardError;

#[tokio::test]
async fn soft_deleted_rows_disappear_and_refuse_mutation() -> Result<()> {
    let h = common::Harness::new();
    let patient = h.actor(Role::Patient).await;
    let appointment = h.create(&patient, "appointments", json!({"status": "scheduled"})).await?;

    let deleted = h.service.delete(&patient, "appointments", appointment.id).await?;
    assert!(deleted.is_deleted());
    // Retained, not removed
    assert!(h.store.get_raw("appointments", appointment.id).await.is_some());

    assert!(matches!(
        h.service.get(&patient, "appointments", appointment.id).await,
        Err(GuardError::NotFound(_))
    ));
    let page = h.service.list(&patient, "appointments", ListParams::default()).await?;
    assert_eq!(page.pagination.records, 0);

    let err = h
        .service
        .update(&patient, "appointments", appointment.id, json!({"notes": "late"}))
        .await
        .unwrap_err();
    assert_eq!(err, GuardError::conflict("appointments is already deleted"));
    let err = h.service.delete(&patient, "appointments", appointment.id).await.unwrap_err();
    assert!(matches!(err, GuardError::Conflict(_)));
    Ok(())
}

#[tokio::test]
async fn restore_brings_a_row_back_once() -> Result<()> {
    let h = common::Harness::new();
    let patient = h.actor(Role::Patient).await;
    let appointment = h.create(&patient, "appointments", json!({"status": "scheduled"})).await?;

    assert!(matches!(
        h.service.restore(&patient, "appointments", appointment.id).await,
        Err(GuardError::Conflict(_))
    ));

    h.service.delete(&patient, "appointments", appointment.id).await?;
    let restored = h.service.restore(&patient, "appointments", appointment.id).await?;
    assert!(!restored.is_deleted());
    assert!(h.service.get(&patient, "appointments", appointment.id).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn locked_status_blocks_update_and_delete() -> Result<()> {
    let h = common::Harness::new();
    let patient = h.actor(Role::Patient).await;
    let appointment = h.create(&patient, "appointments", json!({"status": "scheduled"})).await?;

    let completed = h
        .service
        .update(&patient, "appointments", appointment.id, json!({"status": "completed"}))
        .await?;
    assert_eq!(completed.status, "completed");

    let expected = GuardError::conflict("Completed appointments cannot be changed");
    let err = h
        .service
        .update(&patient, "appointments", appointment.id, json!({"status": "scheduled"}))
        .await
        .unwrap_err();
    assert_eq!(err, expected);
    let err = h.service.delete(&patient, "appointments", appointment.id).await.unwrap_err();
    assert_eq!(err, expected);
    Ok(())
}

#[tokio::test]
async fn referenced_state_cannot_be_deleted() -> Result<()> {
    let h = common::Harness::new();
    let admin = h.actor(Role::SystemAdmin).await;
    let recruiter = h.actor(Role::Recruiter).await;
    let (state, posting) = h.posting(&admin, &recruiter).await?;

    let err = h.service.delete(&admin, "job_posting_states", state.id).await.unwrap_err();
    match &err {
        GuardError::Conflict(message) => assert!(message.contains("still referenced"), "{}", message),
        other => panic!("expected conflict, got {:?}", other),
    }
    let stored = h.store.get_raw("job_posting_states", state.id).await.unwrap();
    assert!(stored.deleted_at.is_none());

    // Soft-deleted postings no longer count as references
    h.service.delete(&recruiter, "job_postings", posting.id).await?;
    let deleted = h.service.delete(&admin, "job_posting_states", state.id).await?;
    assert!(deleted.is_deleted());
    Ok(())
}

#[tokio::test]
async fn duplicate_preference_is_a_conflict_with_one_row_left() -> Result<()> {
    let h = common::Harness::new();
    let member = h.actor(Role::Member).await;
    let body = json!({"attributes": {"dashboard_id": "sales", "layout": "grid"}});

    let first = h.create(&member, "dashboard_preferences", body.clone()).await?;
    let err = h.create(&member, "dashboard_preferences", body.clone()).await.unwrap_err();
    match &err {
        GuardError::Conflict(message) => assert!(message.contains("dashboard_id, user_id"), "{}", message),
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(h.store.count("dashboard_preferences").await, 1);

    // Another user may hold the same dashboard
    let other = h.actor(Role::Member).await;
    h.create(&other, "dashboard_preferences", body.clone()).await?;
    assert_eq!(h.store.count("dashboard_preferences").await, 2);

    // Hard delete frees the key
    h.service.delete(&member, "dashboard_preferences", first.id).await?;
    assert!(h.store.get_raw("dashboard_preferences", first.id).await.is_none());
    h.create(&member, "dashboard_preferences", body).await?;
    assert_eq!(h.store.count("dashboard_preferences").await, 2);
    Ok(())
}

#[tokio::test]
async fn update_cannot_collide_on_a_unique_key() -> Result<()> {
    let h = common::Harness::new();
    let member = h.actor(Role::Member).await;
    h.create(&member, "dashboard_preferences", json!({"attributes": {"dashboard_id": "sales"}}))
        .await?;
    let second = h
        .create(&member, "dashboard_preferences", json!({"attributes": {"dashboard_id": "ops"}}))
        .await?;

    let err = h
        .service
        .update(&member, "dashboard_preferences", second.id, json!({"dashboard_id": "sales"}))
        .await
        .unwrap_err();
    assert!(matches!(err, GuardError::Conflict(_)));
    Ok(())
}

#[tokio::test]
async fn hard_delete_types_cannot_be_restored() -> Result<()> {
    let h = common::Harness::new();
    let member = h.actor(Role::Member).await;
    let pref = h
        .create(&member, "dashboard_preferences", json!({"attributes": {"dashboard_id": "sales"}}))
        .await?;
    assert!(matches!(
        h.service.restore(&member, "dashboard_preferences", pref.id).await,
        Err(GuardError::Validation(_))
    ));
    Ok(())
}

#[tokio::test]
async fn system_fields_cannot_be_written() -> Result<()> {
    let h = common::Harness::new();
    let patient = h.actor(Role::Patient).await;
    let appointment = h.create(&patient, "appointments", json!({"status": "scheduled"})).await?;

    for body in [json!({"deleted_at": null}), json!({"patient_id": uuid::Uuid::new_v4()}), json!({})] {
        let err = h
            .service
            .update(&patient, "appointments", appointment.id, body)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::Validation(_)));
    }
    Ok(())
}
