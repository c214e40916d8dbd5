//! Group roles decide which transactions count.

mod common;

use std::time::Duration;

use common::{eventually, link, node, TIMEOUT};
use covault::core::{AgentSecret, CoMap, Privacy};
use covault::perms::PermsError;
use covault::{CoValueKind, Member, NodeError, Role};
use serde_json::json;

#[tokio::test]
async fn test_reader_writes_are_never_valid() -> anyhow::Result<()> {
    let alice = node(1);
    let bob = node(2);
    link(&bob, &alice).await;

    let group = alice.create_group().await?;
    alice
        .add_member(&group, Member::Agent(bob.agent_id()), Role::Reader)
        .await?;
    let map = alice.create_covalue(CoValueKind::Map, &group).await?;
    alice.map_set(&map, "title", "original").await?;

    bob.load(&map, TIMEOUT).await?;
    assert_eq!(bob.map_get(&map, "title").await?, Some(json!("original")));

    let err = bob.map_set(&map, "title", "refused").await.unwrap_err();
    assert!(matches!(
        err,
        NodeError::Perms(PermsError::NotAuthorized { .. })
    ));

    // Sign a write anyway, bypassing the local check.
    let forged = {
        let bob_secret = AgentSecret::from_seed(&[2; 32]);
        let mut manager = bob.manager().lock().await;
        let registry = manager.registry_mut();
        let tx = registry
            .core_mut(&map)
            .expect("bob has the map")
            .append_transaction(
                &bob_secret,
                bob.session(),
                &[CoMap::set_change("title", "forged")],
                Privacy::Trusting,
                None,
                i64::MAX / 2,
            )?;
        registry.refresh(&map);
        manager.sync_local(&map).await;
        tx
    };

    let (a, tx) = (&alice, &forged);
    eventually("alice to receive the forged write", move || async move {
        matches!(a.is_valid(&map, tx).await, Ok(Some(_)))
    })
    .await?;

    for node in [&alice, &bob] {
        assert_eq!(node.is_valid(&map, &forged).await?, Some(false));
        assert_eq!(node.map_get(&map, "title").await?, Some(json!("original")));
    }
    let manager = alice.manager().lock().await;
    let core = manager.registry().get(&map).expect("alice has the map");
    assert!(core
        .valid_sorted_transactions(true)
        .iter()
        .all(|(key, _)| key.id != forged));
    Ok(())
}

#[tokio::test]
async fn test_revoked_writer_loses_access_but_keeps_history() -> anyhow::Result<()> {
    let alice = node(1);
    let bob = node(2);
    link(&bob, &alice).await;

    let group = alice.create_group().await?;
    alice
        .add_member(&group, Member::Agent(bob.agent_id()), Role::Writer)
        .await?;
    let map = alice.create_covalue(CoValueKind::Map, &group).await?;

    bob.load(&map, TIMEOUT).await?;
    let before = bob.map_set(&map, "by_bob", 1).await?;
    let a = &alice;
    eventually("alice to receive bob's write", move || async move {
        matches!(a.map_get(&map, "by_bob").await, Ok(Some(_)))
    })
    .await?;

    tokio::time::sleep(Duration::from_millis(5)).await;
    alice.remove_member(&group, &bob.agent_id()).await?;
    alice.map_set(&map, "after_revoke", "secret").await?;

    let (a, b) = (&alice, &bob);
    eventually("bob to see the revocation", move || async move {
        b.role_of(&group, &b.agent_id()).await.is_none()
            && b.known_state(&map).await == a.known_state(&map).await
    })
    .await?;

    // Old writes stay valid; new content is unreadable and unwritable.
    assert_eq!(alice.is_valid(&map, &before).await?, Some(true));
    assert_eq!(alice.map_get(&map, "by_bob").await?, Some(json!(1)));
    assert_eq!(bob.map_get(&map, "after_revoke").await?, None);
    assert_eq!(alice.map_get(&map, "after_revoke").await?, Some(json!("secret")));
    assert!(bob.map_set(&map, "by_bob", 2).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_inherited_role_through_parent_group() -> anyhow::Result<()> {
    let alice = node(1);
    let bob = node(2);
    link(&bob, &alice).await;

    let team = alice.create_group().await?;
    alice
        .add_member(&team, Member::Agent(bob.agent_id()), Role::Writer)
        .await?;
    let project = alice.create_group().await?;
    alice
        .extend_group(&project, &team, covault::ParentRole::Extend)
        .await?;
    let map = alice.create_covalue(CoValueKind::Map, &project).await?;
    alice.map_set(&map, "owner", "alice").await?;

    bob.load(&map, TIMEOUT).await?;
    assert_eq!(bob.role_of(&project, &bob.agent_id()).await, Some(Role::Writer));
    assert_eq!(bob.map_get(&map, "owner").await?, Some(json!("alice")));

    bob.map_set(&map, "editor", "bob").await?;
    let a = &alice;
    eventually("bob's inherited write to land", move || async move {
        matches!(a.map_get(&map, "editor").await, Ok(Some(v)) if v == json!("bob"))
    })
    .await?;
    Ok(())
}
