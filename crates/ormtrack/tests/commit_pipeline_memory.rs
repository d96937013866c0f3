//! End-to-end commit pipeline tests against the in-memory store.

mod fixtures;

use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};
use fixtures::{Employee, Project, department, employee, org_session, org_store, project, unwrap_outcome};
use ormtrack::SessionEventCallbacks;
use ormtrack::prelude::*;
use std::sync::{Arc, Mutex};

#[test]
fn insert_assigns_keys_and_settles_state() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        let mut session = org_session(store.clone());

        let alice = session.add(employee(None, "Alice", 1000)).unwrap();
        assert!(alice.key.is_transient());
        assert_eq!(session.state_of(&alice.key), EntityState::Added);

        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 1);

        // Store assigned the key; the entry was rekeyed under it.
        assert_eq!(alice.read().id, Some(1));
        let tracked = session.get::<Employee>(&[Value::BigInt(1)]).unwrap();
        assert_eq!(session.state_of(&tracked.key), EntityState::Unchanged);
        assert!(session.state_of(&alice.key) == EntityState::Detached);
        assert_eq!(store.row_count("employees"), 1);
    });
}

#[test]
fn repeated_loads_share_one_instance() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([employee(Some(1), "Alice", 1000)]).unwrap();
        let mut session = org_session(store);

        let first = unwrap_outcome(session.load::<Employee>(&cx, &[Value::BigInt(1)]).await);
        let second = unwrap_outcome(session.load::<Employee>(&cx, &[Value::BigInt(1)]).await);
        assert!(Arc::ptr_eq(first.entity(), second.entity()));

        first.write().salary = 1100;
        assert_eq!(second.read().salary, 1100);
    });
}

#[test]
fn load_of_missing_row_is_not_found() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let mut session = org_session(org_store());
        let missing = session.load::<Employee>(&cx, &[Value::BigInt(9)]).await;
        assert!(matches!(missing, Outcome::Err(Error::NotFound(_))));
    });
}

#[test]
fn update_persists_only_changed_values() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([employee(Some(1), "Alice", 1000)]).unwrap();
        let mut session = org_session(store.clone());

        let alice = unwrap_outcome(session.load::<Employee>(&cx, &[Value::BigInt(1)]).await);
        alice.write().salary = 1100;
        assert_eq!(session.changed_properties(&alice.key), vec!["salary"]);

        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.updated, 1);
        assert_eq!(session.state_of(&alice.key), EntityState::Unchanged);
        assert_eq!(
            store.row("employees", &[Value::BigInt(1)]).unwrap().get("salary"),
            Some(&Value::BigInt(1100))
        );
    });
}

#[test]
fn reverted_change_commits_nothing() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([employee(Some(1), "Alice", 1000)]).unwrap();
        let mut session = org_session(store);

        let alice = unwrap_outcome(session.load::<Employee>(&cx, &[Value::BigInt(1)]).await);
        alice.write().salary = 1100;
        alice.write().salary = 1000;

        let result = unwrap_outcome(session.commit(&cx).await);
        assert!(result.is_empty());
    });
}

#[test]
fn delete_removes_the_row_and_detaches() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([employee(Some(1), "Alice", 1000)]).unwrap();
        let mut session = org_session(store.clone());

        let alice = unwrap_outcome(session.load::<Employee>(&cx, &[Value::BigInt(1)]).await);
        session.mark_deleted(&alice.key).unwrap();

        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.deleted, 1);
        assert_eq!(session.state_of(&alice.key), EntityState::Detached);
        assert_eq!(store.row_count("employees"), 0);
    });
}

#[test]
fn set_null_cascade_reaches_the_store() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([employee(Some(1), "Meg", 2000)]).unwrap();
        let mut report = employee(Some(2), "Bob", 800);
        report.manager_id = Some(1);
        store.seed([report]).unwrap();

        let mut session = org_session(store.clone());
        let meg = unwrap_outcome(session.load::<Employee>(&cx, &[Value::BigInt(1)]).await);
        let bob = unwrap_outcome(session.load::<Employee>(&cx, &[Value::BigInt(2)]).await);

        session.mark_deleted(&meg.key).unwrap();
        assert_eq!(bob.read().manager_id, None);

        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.deleted, 1);
        assert_eq!(result.updated, 1);
        assert!(store.row("employees", &[Value::BigInt(1)]).is_none());
        assert_eq!(
            store.row("employees", &[Value::BigInt(2)]).unwrap().get("manager_id"),
            Some(&Value::Null)
        );
    });
}

#[test]
fn client_cascade_deletes_untracked_store_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([department(Some(1), "R&D")]).unwrap();
        let mut a = employee(None, "Alice", 1000);
        a.department_id = Some(1);
        let mut b = employee(None, "Bob", 900);
        b.department_id = Some(1);
        store.seed([a, b]).unwrap();

        let mut session = org_session(store.clone());
        let dept = unwrap_outcome(
            session
                .load::<fixtures::Department>(&cx, &[Value::BigInt(1)])
                .await,
        );
        session.mark_deleted(&dept.key).unwrap();

        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.deleted, 3);
        assert_eq!(store.row_count("departments"), 0);
        assert_eq!(store.row_count("employees"), 0);
    });
}

#[test]
fn mutual_references_insert_in_two_phases() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        let mut session = org_session(store.clone());

        let meg = session.add(employee(None, "Meg", 2000)).unwrap();
        let bob = session.add(employee(None, "Bob", 800)).unwrap();
        session
            .set_reference(&meg.key, "manager_id", Some(&bob.key))
            .unwrap();
        session
            .set_reference(&bob.key, "manager_id", Some(&meg.key))
            .unwrap();

        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 2);

        let meg_id = meg.read().id.unwrap();
        let bob_id = bob.read().id.unwrap();
        assert_eq!(meg.read().manager_id, Some(bob_id));
        assert_eq!(bob.read().manager_id, Some(meg_id));
        assert_eq!(
            store
                .row("employees", &[Value::BigInt(meg_id)])
                .unwrap()
                .get("manager_id"),
            Some(&Value::BigInt(bob_id))
        );
        assert_eq!(
            store
                .row("employees", &[Value::BigInt(bob_id)])
                .unwrap()
                .get("manager_id"),
            Some(&Value::BigInt(meg_id))
        );
    });
}

#[test]
fn deferred_reference_resolves_after_principal_insert() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([employee(Some(1), "Bob", 800)]).unwrap();
        let mut session = org_session(store.clone());

        let bob = unwrap_outcome(session.load::<Employee>(&cx, &[Value::BigInt(1)]).await);
        let meg = session.add(employee(None, "Meg", 2000)).unwrap();
        session
            .set_reference(&bob.key, "manager_id", Some(&meg.key))
            .unwrap();
        // The scalar stays NULL until the insert assigns the key
        assert_eq!(bob.read().manager_id, None);

        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.inserted, 1);
        assert_eq!(result.updated, 1);

        let meg_id = meg.read().id.unwrap();
        assert_eq!(bob.read().manager_id, Some(meg_id));
        assert_eq!(
            store
                .row("employees", &[Value::BigInt(1)])
                .unwrap()
                .get("manager_id"),
            Some(&Value::BigInt(meg_id))
        );
    });
}

#[test]
fn link_and_unlink_round_trip_through_the_join_table() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([employee(Some(1), "Alice", 1000)]).unwrap();
        store.seed([project(Some(7), "Apollo")]).unwrap();
        let mut session = org_session(store.clone());

        let alice = unwrap_outcome(session.load::<Employee>(&cx, &[Value::BigInt(1)]).await);
        let apollo = unwrap_outcome(session.load::<Project>(&cx, &[Value::BigInt(7)]).await);

        session.link(&alice.key, "projects", &apollo.key).unwrap();
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.linked, 1);
        assert!(store.joined("project_members", &Value::BigInt(1), &Value::BigInt(7)));

        session.unlink(&apollo.key, "members", &alice.key).unwrap();
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.unlinked, 1);
        assert!(!store.joined("project_members", &Value::BigInt(1), &Value::BigInt(7)));
    });
}

#[test]
fn failed_commit_leaves_added_entries_added() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([employee(Some(1), "Alice", 1000)]).unwrap();
        let mut session = org_session(store.clone());

        let dup = session.add(employee(Some(1), "Eve", 500)).unwrap();
        let outcome = session.commit(&cx).await;
        assert!(matches!(outcome, Outcome::Err(Error::UniqueConstraint(_))));

        // The rejected entry is still pending and the store row untouched.
        assert_eq!(session.state_of(&dup.key), EntityState::Added);
        assert_eq!(
            store.row("employees", &[Value::BigInt(1)]).unwrap().get("name"),
            Some(&Value::Text("Alice".into()))
        );

        // The session stays usable once the offender is gone.
        assert!(session.detach(&dup.key));
        let result = unwrap_outcome(session.commit(&cx).await);
        assert!(result.is_empty());
    });
}

#[test]
fn failed_commit_releases_cascade_expanded_entries() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let store = org_store();
        store.seed([department(Some(1), "R&D")]).unwrap();
        let mut member = employee(Some(2), "Alice", 1000);
        member.department_id = Some(1);
        store.seed([member]).unwrap();
        store.seed([employee(Some(9), "Bob", 900)]).unwrap();

        let mut session = org_session(store.clone());
        let dept = unwrap_outcome(
            session
                .load::<fixtures::Department>(&cx, &[Value::BigInt(1)])
                .await,
        );
        session.mark_deleted(&dept.key).unwrap();
        // A duplicate explicit key makes the insert phase fail after the
        // cascading deletes already ran inside the transaction.
        let dup = session.add(employee(Some(9), "Eve", 500)).unwrap();

        let outcome = session.commit(&cx).await;
        assert!(matches!(outcome, Outcome::Err(Error::UniqueConstraint(_))));

        // The member pulled in for the cascade is released; the explicit
        // work is still pending and the store untouched.
        assert!(session.get::<Employee>(&[Value::BigInt(2)]).is_none());
        assert_eq!(session.state_of(&dept.key), EntityState::Deleted);
        assert_eq!(session.state_of(&dup.key), EntityState::Added);
        assert_eq!(store.row_count("departments"), 1);
        assert_eq!(store.row_count("employees"), 2);

        // Dropping the offender lets the cascade commit cleanly.
        assert!(session.detach(&dup.key));
        let result = unwrap_outcome(session.commit(&cx).await);
        assert_eq!(result.deleted, 2);
        assert_eq!(store.row_count("departments"), 0);
        assert!(store.row("employees", &[Value::BigInt(2)]).is_none());
        assert!(store.row("employees", &[Value::BigInt(9)]).is_some());
    });
}

#[test]
fn commit_callback_reports_the_result() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let seen: Arc<Mutex<Vec<CommitResult>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let mut session = org_session(org_store());
        session.set_event_callbacks(SessionEventCallbacks::new().on_commit(move |result| {
            sink.lock().expect("lock poisoned").push(*result);
        }));

        session.add(employee(None, "Alice", 1000)).unwrap();
        unwrap_outcome(session.commit(&cx).await);

        let seen = seen.lock().expect("lock poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].inserted, 1);
    });
}
