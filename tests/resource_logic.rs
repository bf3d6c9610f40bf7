//! Integration tests for resource projection.
//!
//! These drive the observation partition through whole event sequences and
//! check quantities, state, stage, classification, units and revisions.

mod common;

use common::{APPLE, SPREADER, UNIT, manual_store, observation, specification};
use rea_ledger::{
    ActionId, EventUpdate, FieldUpdate, LedgerError, Measure, NewEvent, NewProcess,
    NewProcessSpecification, NewResourceSpecification, PartitionStatus, Record, RecordId,
    ResourceSeed, ResourceUpdate, ValidationError,
};

#[tokio::test]
async fn events_drive_resource_quantities_state_stage_and_classification() {
    let store = manual_store().await;
    let specs = store.specification().specifications();
    let processes = store.observation().processes();
    let ledger = store.observation().ledger();

    let p_spec_a = specs
        .create_process_specification(NewProcessSpecification::new("test process specification A"))
        .await
        .expect("create process specification");
    let p_spec_b = specs
        .create_process_specification(NewProcessSpecification::new("test process specification B"))
        .await
        .expect("create process specification");
    let r_spec = specs
        .create_resource_specification(
            NewResourceSpecification::new("test resource specification").unit_of_effort(UNIT),
        )
        .await
        .expect("create resource specification");

    let process_a = processes
        .create(NewProcess::new("test process for linking logic").based_on(specification(p_spec_a.id())))
        .await
        .expect("create process");
    let process_b = processes
        .create(
            NewProcess::new("test process for specification stage tracking")
                .based_on(specification(p_spec_b.id())),
        )
        .await
        .expect("create process");

    // Resource created by its first event, specified through the seed.
    let (event, resource) = ledger
        .append(
            NewEvent::new("raise")
                .note("test resource instantiation event")
                .classified_as(APPLE)
                .quantity(8.0, UNIT),
            Some(
                ResourceSeed::default()
                    .note("test resource observed in inventory")
                    .conforms_to(specification(r_spec.id())),
            ),
        )
        .await
        .expect("append event");
    let resource = resource.expect("creating event returns its resource");
    let resource_id = resource.id().clone();
    assert_eq!(event.resource_inventoried_as.as_ref(), Some(&resource_id));
    assert_eq!(resource.accounting_quantity.has_numerical_value, 8.0);
    assert_eq!(resource.unit_of_effort.as_deref(), Some(UNIT));
    assert_eq!(resource.classified_as, event.resource_classified_as);

    // Destination specified through the event instead of the seed.
    let (_, dest) = ledger
        .append(
            NewEvent::new("raise")
                .classified_as(APPLE)
                .quantity(0.0, UNIT)
                .conforms_to(specification(r_spec.id())),
            Some(ResourceSeed::default().note("destination resource for move target")),
        )
        .await
        .expect("append event");
    let dest = dest.expect("creating event returns its resource");
    assert_eq!(dest.unit_of_effort.as_deref(), Some(UNIT));

    // Move.
    ledger
        .append(
            NewEvent::new("move")
                .of_resource(resource_id.clone())
                .to_resource(dest.id().clone())
                .at_location("urn:location:barn")
                .quantity(1.0, UNIT),
            None,
        )
        .await
        .expect("append event");
    let read = ledger.get_resource(&resource_id).await.expect("get resource");
    assert_eq!(read.current_location.as_deref(), Some("urn:location:barn"));
    let read_dest = ledger.get_resource(dest.id()).await.expect("get resource");
    assert_eq!(read_dest.accounting_quantity, Measure::new(1.0, UNIT));

    // State and stage.
    ledger
        .append(
            NewEvent::new("pass")
                .of_resource(resource_id.clone())
                .output_of(observation(process_a.record.id()))
                .quantity(8.0, UNIT),
            None,
        )
        .await
        .expect("append event");
    let read = ledger.get_resource(&resource_id).await.expect("get resource");
    assert_eq!(read.state, Some(ActionId::Pass));
    assert_eq!(read.stage, Some(specification(p_spec_a.id())));

    // Arithmetic: 8 - 1 + 8.
    let (_, read) = ledger
        .append(
            NewEvent::new("raise").of_resource(resource_id.clone()).quantity(8.0, UNIT),
            None,
        )
        .await
        .expect("append event");
    let read = read.expect("event has a subject");
    assert_eq!(read.accounting_quantity, Measure::new(15.0, UNIT));
    assert_eq!(read.onhand_quantity, Measure::new(15.0, UNIT));

    let (_, read) = ledger
        .append(
            NewEvent::new("lower").of_resource(resource_id.clone()).quantity(2.0, UNIT),
            None,
        )
        .await
        .expect("append event");
    let read = read.expect("event has a subject");
    assert_eq!(read.accounting_quantity, Measure::new(13.0, UNIT));
    assert_eq!(read.onhand_quantity, Measure::new(13.0, UNIT));

    let (_, read) = ledger
        .append(
            NewEvent::new("transfer-custody")
                .of_resource(resource_id.clone())
                .quantity(1.0, UNIT),
            None,
        )
        .await
        .expect("append event");
    let read = read.expect("event has a subject");
    assert_eq!(read.accounting_quantity, Measure::new(13.0, UNIT));
    assert_eq!(read.onhand_quantity, Measure::new(12.0, UNIT));

    let (_, read) = ledger
        .append(
            NewEvent::new("transfer-all-rights")
                .of_resource(resource_id.clone())
                .quantity(1.0, UNIT),
            None,
        )
        .await
        .expect("append event");
    let read = read.expect("event has a subject");
    assert_eq!(read.accounting_quantity, Measure::new(12.0, UNIT));
    assert_eq!(read.onhand_quantity, Measure::new(12.0, UNIT));

    // Transfer into a second, empty resource.
    let (_, receiver) = ledger
        .append(
            NewEvent::new("raise").classified_as(APPLE).quantity(0.0, UNIT),
            Some(
                ResourceSeed::default()
                    .note("receiver test resource")
                    .conforms_to(specification(r_spec.id())),
            ),
        )
        .await
        .expect("append event");
    let receiver = receiver.expect("creating event returns its resource");
    ledger
        .append(
            NewEvent::new("transfer")
                .of_resource(resource_id.clone())
                .to_resource(receiver.id().clone())
                .quantity(3.0, UNIT),
            None,
        )
        .await
        .expect("append event");
    let read = ledger.get_resource(&resource_id).await.expect("get resource");
    assert_eq!(read.accounting_quantity, Measure::new(9.0, UNIT));
    assert_eq!(read.onhand_quantity, Measure::new(9.0, UNIT));
    let read = ledger.get_resource(receiver.id()).await.expect("get resource");
    assert_eq!(read.accounting_quantity, Measure::new(3.0, UNIT));
    assert_eq!(read.onhand_quantity, Measure::new(3.0, UNIT));

    // Last pass/fail wins for state, last output process for stage.
    ledger
        .append(
            NewEvent::new("fail")
                .of_resource(resource_id.clone())
                .output_of(observation(process_b.record.id()))
                .quantity(3.0, UNIT),
            None,
        )
        .await
        .expect("append event");
    let read = ledger.get_resource(&resource_id).await.expect("get resource");
    assert_eq!(read.state, Some(ActionId::Fail));
    assert_eq!(read.stage, Some(specification(p_spec_b.id())));

    // Classification union, one occurrence each.
    for _ in 0..2 {
        ledger
            .append(
                NewEvent::new("raise")
                    .of_resource(resource_id.clone())
                    .classified_as(SPREADER)
                    .quantity(1.0, UNIT),
                None,
            )
            .await
            .expect("append event");
        let read = ledger.get_resource(&resource_id).await.expect("get resource");
        assert_eq!(read.classified_as, vec![APPLE, SPREADER]);
    }

    store.shutdown().await.expect("shut down store");
}

#[tokio::test]
async fn resource_needs_a_specification_or_classification() {
    let store = manual_store().await;
    let ledger = store.observation().ledger();
    let spec = store
        .specification()
        .specifications()
        .create_resource_specification(NewResourceSpecification::new("apples"))
        .await
        .expect("create resource specification");

    let err = ledger
        .append(
            NewEvent::new("raise").quantity(1.0, UNIT),
            Some(ResourceSeed::default()),
        )
        .await
        .expect_err("append event should fail");
    assert!(
        err.to_string()
            .contains("EconomicResource must have either a specification or classification"),
        "got: {err}"
    );
    assert!(ledger.list().await.is_empty(), "nothing should be committed");

    let accepted = [
        (
            NewEvent::new("raise").quantity(1.0, UNIT),
            ResourceSeed::default().conforms_to(specification(spec.id())),
        ),
        (
            NewEvent::new("raise")
                .quantity(1.0, UNIT)
                .conforms_to(specification(spec.id())),
            ResourceSeed::default(),
        ),
        (
            NewEvent::new("raise").quantity(1.0, UNIT).classified_as(APPLE),
            ResourceSeed::default(),
        ),
    ];
    for (event, seed) in accepted {
        let (_, resource) = ledger.append(event, Some(seed)).await.expect("append event");
        assert!(resource.is_some());
    }
    assert_eq!(ledger.list_resources().await.expect("list resources").len(), 3);
}

#[tokio::test]
async fn stale_revisions_conflict_and_current_ones_succeed() {
    let store = manual_store().await;
    let ledger = store.observation().ledger();
    let (event, resource) = ledger
        .append(
            NewEvent::new("produce").quantity(4.0, UNIT).classified_as(APPLE),
            Some(ResourceSeed::default()),
        )
        .await
        .expect("append event");
    let resource = resource.expect("creating event returns its resource");

    let (updated, _) = ledger
        .update(
            &event.revision_id,
            EventUpdate {
                note: FieldUpdate::Set("corrected".into()),
                ..EventUpdate::default()
            },
        )
        .await
        .expect("update event");
    assert_eq!(updated.id(), event.id());
    assert_eq!(updated.sequence, event.sequence);
    assert_eq!(updated.revision_id.seq, event.revision_id.seq + 1);

    let err = ledger.remove(&event.revision_id).await.expect_err("remove event should fail");
    assert!(matches!(err, LedgerError::Conflict { .. }), "got: {err:?}");

    // The first revision stays readable.
    let original = ledger.revision(&event.revision_id).await.expect("read revision");
    assert_eq!(original.note, None);

    ledger.remove(&updated.revision_id).await.expect("remove event");
    let err = ledger.get(event.id()).await.expect_err("get event should fail");
    assert_eq!(
        err.to_string(),
        format!("no economic_event record found for {}", event.id())
    );

    // Every write above advanced the resource revision.
    let err = ledger
        .update_resource(&resource.revision_id, ResourceUpdate::default())
        .await
        .expect_err("update resource should fail");
    assert!(matches!(err, LedgerError::Conflict { .. }), "got: {err:?}");

    let current = ledger.get_resource(resource.id()).await.expect("get resource");
    let renamed = ledger
        .update_resource(
            &current.revision_id,
            ResourceUpdate {
                name: FieldUpdate::Set("crate of apples".into()),
                ..ResourceUpdate::default()
            },
        )
        .await
        .expect("update resource");
    assert_eq!(renamed.name.as_deref(), Some("crate of apples"));
    assert_eq!(renamed.accounting_quantity.has_numerical_value, 0.0);
}

#[tokio::test]
async fn removing_an_event_re_derives_last_writer_wins_fields() {
    let store = manual_store().await;
    let ledger = store.observation().ledger();
    let (_, resource) = ledger
        .append(
            NewEvent::new("raise").quantity(5.0, UNIT).classified_as(APPLE),
            Some(ResourceSeed::default()),
        )
        .await
        .expect("append event");
    let id = resource.expect("creating event returns its resource").id().clone();

    ledger
        .append(NewEvent::new("pass").of_resource(id.clone()), None)
        .await
        .expect("append event");
    let (fail, read) = ledger
        .append(NewEvent::new("fail").of_resource(id.clone()), None)
        .await
        .expect("append event");
    assert_eq!(read.expect("event has a subject").state, Some(ActionId::Fail));

    ledger.remove(&fail.revision_id).await.expect("remove event");
    let read = ledger.get_resource(&id).await.expect("get resource");
    assert_eq!(read.state, Some(ActionId::Pass));
    assert_eq!(read.accounting_quantity.has_numerical_value, 5.0);
    assert_eq!(ledger.events_affecting(&id).await.len(), 2);
}

#[tokio::test]
async fn invalid_events_are_rejected_before_commit() {
    let store = manual_store().await;
    let ledger = store.observation().ledger();
    let (_, resource) = ledger
        .append(
            NewEvent::new("raise").quantity(1.0, UNIT).classified_as(APPLE),
            Some(ResourceSeed::default()),
        )
        .await
        .expect("append event");
    let id = resource.expect("creating event returns its resource").id().clone();

    let cases = [
        NewEvent::new("teleport").of_resource(id.clone()),
        NewEvent::new("consume").of_resource(id.clone()),
        NewEvent::new("transfer")
            .of_resource(id.clone())
            .to_resource(id.clone())
            .quantity(0.0, UNIT),
        NewEvent::new("raise").of_resource(id.clone()).quantity(-1.0, UNIT),
        NewEvent::new("raise").of_resource(id.clone()).quantity(1.0, "urn:unit:lb"),
        NewEvent::new("lower")
            .of_resource(id.clone())
            .to_resource(id.clone())
            .quantity(1.0, UNIT),
    ];
    for event in cases {
        let action = event.action.clone();
        let err = ledger.append(event, None).await.expect_err("append event should fail");
        assert!(
            matches!(err, LedgerError::Validation(_)),
            "{action}: expected a validation error, got {err:?}"
        );
    }

    let err = ledger
        .append(
            NewEvent::new("raise").of_resource(id.clone()).quantity(1.0, UNIT),
            Some(ResourceSeed::default()),
        )
        .await
        .expect_err("append event should fail");
    assert!(matches!(
        err,
        LedgerError::Validation(ValidationError::ConflictingResourceReference)
    ));

    let err = ledger
        .append(
            NewEvent::new("raise")
                .of_resource(RecordId::from("missing"))
                .quantity(1.0, UNIT),
            None,
        )
        .await
        .expect_err("append event should fail");
    assert!(matches!(err, LedgerError::NotFound { .. }), "got: {err:?}");

    assert_eq!(ledger.list().await.len(), 1);
}

#[tokio::test]
async fn specification_lookup_failures() {
    let store = manual_store().await;
    let ledger = store.observation().ledger();
    let missing = specification(&RecordId::from("no-such-spec"));

    // Not found: created without a unit.
    let (_, resource) = ledger
        .append(
            NewEvent::new("raise").quantity(1.0, UNIT),
            Some(ResourceSeed::default().conforms_to(missing.clone())),
        )
        .await
        .expect("append event");
    assert_eq!(resource.expect("creating event returns its resource").unit_of_effort, None);

    // Unreachable: nothing committed.
    assert!(
        store
            .gateway()
            .set_status("specification", PartitionStatus::Unreachable)
    );
    let err = ledger
        .append(
            NewEvent::new("raise").quantity(1.0, UNIT),
            Some(ResourceSeed::default().conforms_to(missing)),
        )
        .await
        .expect_err("append event should fail");
    assert!(err.is_transient(), "got: {err:?}");
    assert_eq!(ledger.list().await.len(), 1);
    assert_eq!(ledger.list_resources().await.expect("list resources").len(), 1);
}

#[tokio::test]
async fn seeded_transfer_advances_the_destination_revision() {
    let store = manual_store().await;
    let ledger = store.observation().ledger();
    let (_, dest) = ledger
        .append(
            NewEvent::new("raise").quantity(0.0, UNIT).classified_as(APPLE),
            Some(ResourceSeed::default()),
        )
        .await
        .expect("append event");
    let before = dest.expect("creating event returns its resource");

    let (_, source) = ledger
        .append(
            NewEvent::new("transfer")
                .to_resource(before.id().clone())
                .quantity(3.0, UNIT)
                .classified_as(APPLE),
            Some(ResourceSeed::default().note("created by its outgoing transfer")),
        )
        .await
        .expect("append event");
    let source = source.expect("event has a subject");
    assert_eq!(source.accounting_quantity, Measure::new(-3.0, UNIT));

    let after = ledger.get_resource(before.id()).await.expect("get resource");
    assert_eq!(after.accounting_quantity, Measure::new(3.0, UNIT));
    assert!(after.revision_id.seq > before.revision_id.seq);

    let err = ledger
        .update_resource(&before.revision_id, ResourceUpdate::default())
        .await
        .expect_err("update resource should fail");
    assert!(matches!(err, LedgerError::Conflict { .. }), "got: {err:?}");
}

#[tokio::test]
async fn creating_event_unit_must_match_the_specification() {
    let store = manual_store().await;
    let ledger = store.observation().ledger();
    let spec = store
        .specification()
        .specifications()
        .create_resource_specification(NewResourceSpecification::new("apples").unit_of_effort(UNIT))
        .await
        .expect("create resource specification");

    let err = ledger
        .append(
            NewEvent::new("raise").quantity(8.0, "urn:unit:lb"),
            Some(ResourceSeed::default().conforms_to(specification(spec.id()))),
        )
        .await
        .expect_err("append event should fail");
    assert!(
        matches!(
            &err,
            LedgerError::Validation(ValidationError::UnitMismatch { expected, found, .. })
                if expected == UNIT && found == "urn:unit:lb"
        ),
        "got: {err:?}"
    );
    assert!(ledger.list().await.is_empty(), "nothing should be committed");
    assert!(ledger.list_resources().await.expect("list resources").is_empty());

    let (_, resource) = ledger
        .append(
            NewEvent::new("raise").quantity(8.0, UNIT),
            Some(ResourceSeed::default().conforms_to(specification(spec.id()))),
        )
        .await
        .expect("append event");
    let resource = resource.expect("creating event returns its resource");
    assert_eq!(resource.accounting_quantity, Measure::new(8.0, UNIT));
}
