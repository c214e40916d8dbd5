//! Nodes that exchanged all transactions of a CoValue materialize the same content.

mod common;

use common::{eventually, link, node, TIMEOUT};
use covault::{CoValueKind, Member, Role};
use serde_json::json;

#[tokio::test]
async fn test_two_nodes_converge_on_a_shared_map() -> anyhow::Result<()> {
    let alice = node(1);
    let bob = node(2);
    link(&alice, &bob).await;

    let group = alice.create_group().await?;
    alice
        .add_member(&group, Member::Agent(bob.agent_id()), Role::Writer)
        .await?;
    let map = alice.create_covalue(CoValueKind::Map, &group).await?;
    alice.map_set(&map, "from_alice", 1).await?;
    alice.wait_for_sync(&map, TIMEOUT).await?;

    bob.load(&map, TIMEOUT).await?;
    assert_eq!(bob.map_get(&map, "from_alice").await?, Some(json!(1)));

    bob.map_set(&map, "from_bob", 2).await?;
    alice.map_set(&map, "shared", "a").await?;
    bob.map_set(&map, "shared", "b").await?;

    let (a, b) = (&alice, &bob);
    eventually("maps to converge", move || async move {
        match (a.content(&map).await, b.content(&map).await) {
            (Ok(x), Ok(y)) => x == y && x.as_map().is_some_and(|m| m.len() == 3),
            _ => false,
        }
    })
    .await?;

    assert_eq!(alice.known_state(&map).await, bob.known_state(&map).await);
    assert_eq!(alice.map_get(&map, "from_bob").await?, Some(json!(2)));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_list_and_text_edits_converge() -> anyhow::Result<()> {
    let alice = node(1);
    let bob = node(2);
    link(&alice, &bob).await;

    let group = alice.create_group().await?;
    alice
        .add_member(&group, Member::Agent(bob.agent_id()), Role::Writer)
        .await?;

    let list = alice.create_covalue(CoValueKind::List, &group).await?;
    for i in 0..20 {
        alice.list_push(&list, i).await?;
    }
    let text = alice.create_covalue(CoValueKind::PlainText, &group).await?;
    alice.text_append(&text, "hello world").await?;
    alice.wait_for_sync(&list, TIMEOUT).await?;
    alice.wait_for_sync(&text, TIMEOUT).await?;

    bob.load(&list, TIMEOUT).await?;
    bob.load(&text, TIMEOUT).await?;
    bob.list_insert_after(&list, Some(4), "x").await?;
    alice.list_delete(&list, 0).await?;
    bob.text_insert(&text, Some(4), ",").await?;

    let (a, b) = (&alice, &bob);
    eventually("lists to converge", move || async move {
        match (a.content(&list).await, b.content(&list).await) {
            (Ok(x), Ok(y)) => x == y && x.as_list().is_some_and(|l| l.len() == 20),
            _ => false,
        }
    })
    .await?;
    eventually("texts to converge", move || async move {
        let x = a.content(&text).await.map(|c| c.to_json()).ok();
        let y = b.content(&text).await.map(|c| c.to_json()).ok();
        x == y && x == Some(json!("hello, world"))
    })
    .await?;

    let items = alice.content(&list).await?.to_json();
    assert_eq!(items[0], json!(1));
    assert_eq!(items[4], json!("x"));
    Ok(())
}

#[tokio::test]
async fn test_server_forwards_to_subscribed_clients() -> anyhow::Result<()> {
    let alice = node(1);
    let carol = node(3);
    let server = node(9);
    link(&alice, &server).await;
    link(&carol, &server).await;

    let group = alice.create_group().await?;
    alice
        .add_member(&group, Member::Agent(carol.agent_id()), Role::Reader)
        .await?;
    let map = alice.create_covalue(CoValueKind::Map, &group).await?;
    alice.map_set(&map, "early", 1).await?;
    alice.wait_for_sync(&map, TIMEOUT).await?;

    carol.load(&map, TIMEOUT).await?;
    assert_eq!(carol.map_get(&map, "early").await?, Some(json!(1)));

    alice.map_set(&map, "late", 2).await?;
    let c = &carol;
    eventually("late write to reach carol", move || async move {
        matches!(c.map_get(&map, "late").await, Ok(Some(v)) if v == json!(2))
    })
    .await?;

    // The server holds everything but can read none of it.
    assert_eq!(server.known_state(&map).await, alice.known_state(&map).await);
    assert_eq!(server.map_get(&map, "early").await?, None);
    Ok(())
}
