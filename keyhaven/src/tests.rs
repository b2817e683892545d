// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeSet;

use assert_matches::assert_matches;
use keyhaven_store::MemoryStore;

use crate::account::AccountError;
use crate::card::{Card, CardManager, FindUsersResult};
use crate::cbor::{decode_cbor, encode_cbor};
use crate::config::Config;
use crate::cloud::{CloudTicketStorage, TicketStorageProvider};
use crate::crypto::{Crypto, NativeCrypto};
use crate::data::Data;
use crate::group::GroupError;
use crate::local_storage::{GroupLocalStorage, RetrieveOptions};
use crate::test_utils::{TestAccount, TestNetwork, setup_logging};

const GROUP_ID: &[u8] = b"weekend-hiking-trip";

fn participants(identities: &[&str]) -> BTreeSet<String> {
    identities.iter().map(|identity| identity.to_string()).collect()
}

async fn card(account: &TestAccount, identity: &str) -> Card {
    let mut users = account.find_users(&[identity.to_owned()]).await.unwrap();
    users.remove(identity).unwrap()
}

async fn users(account: &TestAccount, identities: &[&str]) -> FindUsersResult {
    let identities: Vec<String> = identities.iter().map(|id| id.to_string()).collect();
    account.find_users(&identities).await.unwrap()
}

/// Cards of identities which never registered, sharing the public key of an existing card.
fn unregistered_cards(count: usize, public_key_of: &Card) -> Vec<Card> {
    (0..count)
        .map(|i| Card {
            id: format!("unregistered-{i}"),
            identity: format!("user-{i:03}"),
            public_key: public_key_of.public_key,
            created_at: 0,
            previous_card: None,
        })
        .collect()
}

#[tokio::test]
async fn add_remove_and_update() {
    setup_logging();

    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let bob = network.registered("bob", 2).await;
    let charlie = network.registered("charlie", 3).await;

    // Alice creates a group with Bob.
    let mut alice_group = alice
        .create_group(GROUP_ID, users(&alice, &["bob"]).await)
        .await
        .unwrap();
    assert_eq!(alice_group.participants(), &participants(&["alice", "bob"]));
    assert_eq!(alice_group.current_epoch_number(), 0);
    assert!(alice_group.is_editable());

    let alice_card = card(&bob, "alice").await;
    let mut bob_group = bob.load_group(GROUP_ID, &alice_card).await.unwrap();
    assert_eq!(bob_group.session_id(), alice_group.session_id());
    assert_eq!(bob_group.initiator(), "alice");
    assert!(!bob_group.is_editable());

    let hello = alice_group.encrypt("hello").await.unwrap();
    assert_matches!(&hello, Data::Text(_));
    assert_eq!(
        bob_group.decrypt(hello.clone(), &alice_card, None).await.unwrap(),
        Data::Text("hello".into())
    );

    // Charlie is added without a new epoch.
    alice_group.add(card(&alice, "charlie").await).await.unwrap();
    assert_eq!(alice_group.current_epoch_number(), 0);
    assert_eq!(
        alice_group.participants(),
        &participants(&["alice", "bob", "charlie"])
    );

    let hi_all = alice_group.encrypt("hi all").await.unwrap();
    let mut charlie_group = charlie.load_group(GROUP_ID, &alice_card).await.unwrap();
    assert_eq!(
        charlie_group.participants(),
        &participants(&["alice", "bob", "charlie"])
    );
    assert_eq!(
        charlie_group
            .decrypt(hi_all.clone(), &alice_card, None)
            .await
            .unwrap(),
        Data::Text("hi all".into())
    );
    assert_eq!(
        bob_group.decrypt(hi_all.clone(), &alice_card, None).await.unwrap(),
        Data::Text("hi all".into())
    );

    // Bob is removed which rotates the group into a new epoch.
    alice_group.remove(card(&alice, "bob").await).await.unwrap();
    assert_eq!(alice_group.current_epoch_number(), 1);
    assert_eq!(
        alice_group.participants(),
        &participants(&["alice", "charlie"])
    );

    let secret = alice_group.encrypt("secret").await.unwrap();
    assert_matches!(
        bob_group.decrypt(secret.clone(), &alice_card, None).await,
        Err(GroupError::GroupIsOutdated)
    );
    assert_matches!(
        charlie_group.decrypt(secret.clone(), &alice_card, None).await,
        Err(GroupError::GroupIsOutdated)
    );

    charlie_group.update().await.unwrap();
    assert_eq!(charlie_group.current_epoch_number(), 1);
    assert_eq!(
        charlie_group.participants(),
        &participants(&["alice", "charlie"])
    );
    assert_eq!(
        charlie_group
            .decrypt(secret.clone(), &alice_card, None)
            .await
            .unwrap(),
        Data::Text("secret".into())
    );

    // Bob can still read old epochs but can not fetch the new one.
    assert_eq!(
        bob_group.decrypt(hi_all, &alice_card, None).await.unwrap(),
        Data::Text("hi all".into())
    );
    assert_matches!(bob_group.update().await, Err(GroupError::GroupNotFound));
    assert!(bob.get_group(GROUP_ID).await.unwrap().is_none());
}

#[tokio::test]
async fn bytes_stay_bytes() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let bob = network.registered("bob", 2).await;

    let alice_group = alice
        .create_group(GROUP_ID, card(&alice, "bob").await)
        .await
        .unwrap();
    let bob_group = bob
        .load_group(GROUP_ID, &card(&bob, "alice").await)
        .await
        .unwrap();

    let encrypted = alice_group.encrypt(vec![1, 2, 3]).await.unwrap();
    assert_matches!(&encrypted, Data::Bytes(_));

    let decrypted = bob_group
        .decrypt(encrypted, &card(&bob, "alice").await, None)
        .await
        .unwrap();
    assert_eq!(decrypted, Data::Bytes(vec![1, 2, 3]));

    assert_matches!(
        bob_group
            .decrypt("not base64!", &card(&bob, "alice").await, None)
            .await,
        Err(GroupError::InvalidEncoding)
    );
}

#[tokio::test]
async fn message_from_another_group() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let _bob = network.registered("bob", 2).await;

    let group = alice
        .create_group(GROUP_ID, card(&alice, "bob").await)
        .await
        .unwrap();
    let other_group = alice
        .create_group(b"another-group-id", card(&alice, "bob").await)
        .await
        .unwrap();
    assert_ne!(group.session_id(), other_group.session_id());

    let alice_card = card(&alice, "alice").await;
    let encrypted = other_group.encrypt("hello").await.unwrap();
    assert_matches!(
        group.decrypt(encrypted, &alice_card, None).await,
        Err(GroupError::MessageNotFromThisGroup)
    );
}

#[tokio::test]
async fn participant_bounds() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let alice_card = card(&alice, "alice").await;

    // Alice alone is not a group.
    assert_matches!(
        alice.create_group(GROUP_ID, alice_card.clone()).await,
        Err(GroupError::InvalidParticipantsCount(1))
    );

    // Rejected before anything reaches the cloud.
    let too_many = unregistered_cards(100, &alice_card);
    assert_matches!(
        alice.create_group(GROUP_ID, too_many).await,
        Err(GroupError::InvalidParticipantsCount(101))
    );
    let session_id = NativeCrypto::new().calculate_group_session_id(GROUP_ID);
    assert!(network.cloud.recipients(&session_id, 0).await.is_none());

    // The initiator and one more participant is the smallest group.
    let group = alice
        .create_group(b"two-people-group", unregistered_cards(1, &alice_card))
        .await
        .unwrap();
    assert_eq!(group.participants().len(), 2);

    let mut group = alice
        .create_group(GROUP_ID, unregistered_cards(99, &alice_card))
        .await
        .unwrap();
    assert_eq!(group.participants().len(), 100);

    let mut one_more = unregistered_cards(100, &alice_card);
    assert_matches!(
        group.add(one_more.remove(99)).await,
        Err(GroupError::InvalidParticipantsCount(101))
    );
    assert_eq!(group.participants().len(), 100);
}

#[tokio::test]
async fn invalid_participant_changes() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let bob = network.registered("bob", 2).await;
    let _charlie = network.registered("charlie", 3).await;

    let mut alice_group = alice
        .create_group(GROUP_ID, card(&alice, "bob").await)
        .await
        .unwrap();

    assert_matches!(
        alice_group.add(card(&alice, "bob").await).await,
        Err(GroupError::InvalidChangeParticipants)
    );
    assert_matches!(
        alice_group.remove(card(&alice, "charlie").await).await,
        Err(GroupError::InvalidChangeParticipants)
    );
    assert_matches!(
        alice_group.remove(card(&alice, "bob").await).await,
        Err(GroupError::InvalidParticipantsCount(1))
    );
    assert_eq!(alice_group.current_epoch_number(), 0);

    // Only the initiator can change participants or delete the group.
    let mut bob_group = bob
        .load_group(GROUP_ID, &card(&bob, "alice").await)
        .await
        .unwrap();
    assert_matches!(
        bob_group.add(card(&bob, "charlie").await).await,
        Err(GroupError::PermissionDenied)
    );
    assert_matches!(
        bob_group.remove(card(&bob, "alice").await).await,
        Err(GroupError::PermissionDenied)
    );
    assert_matches!(
        bob_group.re_add(&card(&bob, "charlie").await).await,
        Err(GroupError::PermissionDenied)
    );
    assert_matches!(
        bob.delete_group(GROUP_ID).await,
        Err(GroupError::PermissionDenied)
    );
}

#[tokio::test]
async fn group_ids_need_minimum_length() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let _bob = network.registered("bob", 2).await;
    let bob_card = card(&alice, "bob").await;

    assert_matches!(
        alice.create_group(b"short", bob_card.clone()).await,
        Err(GroupError::ShortGroupId(10))
    );
    assert_matches!(
        alice.load_group(b"short", &bob_card).await,
        Err(GroupError::ShortGroupId(10))
    );
    assert_matches!(
        alice.get_group(b"short").await,
        Err(GroupError::ShortGroupId(10))
    );

    let relaxed = network.account(Config::new("dave").with_group_id_min_length(3), 4);
    relaxed.register().await.unwrap();
    assert!(relaxed.create_group(b"short", bob_card).await.is_ok());
}

#[tokio::test]
async fn registration() {
    let network = TestNetwork::new();
    let alice = network.account(Config::new("alice"), 1);
    let _bob = network.registered("bob", 2).await;
    assert!(!alice.has_local_key_pair().await);

    let bob_card = network
        .directory
        .search_cards(&["bob".to_owned()])
        .await
        .unwrap()
        .remove(0);
    assert_matches!(
        alice.create_group(GROUP_ID, bob_card).await,
        Err(GroupError::RegistrationRequired)
    );

    let alice_card = alice.register().await.unwrap();
    assert_eq!(alice_card.identity, "alice");
    assert!(alice.has_local_key_pair().await);
    assert_matches!(alice.register().await, Err(AccountError::AlreadyRegistered));

    assert_matches!(
        alice
            .find_users(&["bob".to_owned(), "mallory".to_owned()])
            .await,
        Err(AccountError::CardNotFound(identity)) if identity == "mallory"
    );

    // Unregistering revokes the card and clears all local state.
    alice
        .create_group(GROUP_ID, card(&alice, "bob").await)
        .await
        .unwrap();
    assert_eq!(alice.manager().cache().len().await, 1);

    alice.unregister().await.unwrap();
    assert!(!alice.has_local_key_pair().await);
    assert!(alice.manager().cache().is_empty().await);
    assert_matches!(
        alice.find_users(&["alice".to_owned()]).await,
        Err(AccountError::CardNotFound(_))
    );
    assert_matches!(alice.unregister().await, Err(AccountError::RegistrationRequired));
}

#[tokio::test]
async fn cleanup_forgets_local_key_pair() {
    let network = TestNetwork::new();
    let backend = MemoryStore::new();
    let alice = network.account_with_storage(Config::new("alice"), 1, backend.clone());
    alice.register().await.unwrap();
    let _bob = network.registered("bob", 2).await;

    alice.cleanup().await.unwrap();
    assert!(!alice.has_local_key_pair().await);
    assert!(!alice.manager().local_storage().has_encryption_key_pair());
    assert_matches!(
        alice.get_group(GROUP_ID).await,
        Err(GroupError::RegistrationRequired)
    );

    // The cache is sealed with whatever key pair gets loaded next.
    let key_pair = NativeCrypto::from_seed([9; 32])
        .generate_key_pair()
        .unwrap();
    alice
        .manager()
        .key_loader()
        .set_key_pair(key_pair.clone())
        .await;
    let group = alice
        .create_group(GROUP_ID, card(&alice, "bob").await)
        .await
        .unwrap();

    let local_storage = GroupLocalStorage::new("alice", backend, NativeCrypto::new());
    local_storage.set_encryption_key_pair(key_pair).unwrap();
    let cached = local_storage
        .retrieve(&group.session_id(), RetrieveOptions::ticket_count(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.tickets.len(), 1);
}

#[tokio::test]
async fn restore_from_local_storage() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let _bob = network.registered("bob", 2).await;
    let _charlie = network.registered("charlie", 3).await;

    let mut group = alice
        .create_group(GROUP_ID, users(&alice, &["bob", "charlie"]).await)
        .await
        .unwrap();
    group.remove(card(&alice, "charlie").await).await.unwrap();
    let encrypted = group.encrypt("still here").await.unwrap();

    // From the in-memory index.
    let indexed = alice.get_group(GROUP_ID).await.unwrap().unwrap();
    assert_eq!(indexed.current_epoch_number(), 1);
    assert_eq!(indexed.participants(), &participants(&["alice", "bob"]));

    // From the encrypted local cache after the index was dropped.
    alice.manager().cache().clear().await;
    let restored = alice.get_group(GROUP_ID).await.unwrap().unwrap();
    assert_eq!(restored.session_id(), group.session_id());
    assert_eq!(restored.current_epoch_number(), 1);
    assert_eq!(restored.participants(), &participants(&["alice", "bob"]));
    assert!(restored.is_editable());
    assert!(
        alice
            .manager()
            .cache()
            .contains(&restored.session_id())
            .await
    );

    let alice_card = card(&alice, "alice").await;
    assert_eq!(
        restored.decrypt(encrypted, &alice_card, None).await.unwrap(),
        Data::Text("still here".into())
    );

    assert!(
        alice
            .get_group(b"never-created-group")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn decrypt_beyond_ratchet_window() {
    let network = TestNetwork::new();
    let alice = network.account(Config::new("alice").with_ratchet_window(2), 1);
    alice.register().await.unwrap();
    let alice_card = card(&alice, "alice").await;

    let others = unregistered_cards(4, &alice_card);
    let mut group = alice.create_group(GROUP_ID, others.clone()).await.unwrap();
    let first = group.encrypt("first").await.unwrap();

    group.remove(others[0].clone()).await.unwrap();
    group.remove(others[1].clone()).await.unwrap();
    let recent = group.encrypt("recent").await.unwrap();
    group.remove(others[2].clone()).await.unwrap();
    assert_eq!(group.current_epoch_number(), 3);

    // Within the window the group session decrypts directly.
    assert_eq!(
        group.decrypt(recent, &alice_card, None).await.unwrap(),
        Data::Text("recent".into())
    );

    // Older messages go through a snapshot of the group at their epoch.
    assert_eq!(
        group.decrypt(first.clone(), &alice_card, None).await.unwrap(),
        Data::Text("first".into())
    );

    alice
        .manager()
        .local_storage()
        .delete(&group.session_id())
        .await
        .unwrap();
    assert_matches!(
        group.decrypt(first, &alice_card, None).await,
        Err(GroupError::LocalGroupNotFound(0))
    );
}

/// Configuration as it would arrive from a settings file.
fn decoded_config(identity: &str, ratchet_window: u32) -> Config {
    #[derive(serde::Serialize)]
    struct Settings<'a> {
        identity: &'a str,
        ratchet_window: u32,
        group_id_min_length: usize,
    }

    let bytes = encode_cbor(&Settings {
        identity,
        ratchet_window,
        group_id_min_length: 10,
    })
    .unwrap();
    decode_cbor(&bytes).unwrap()
}

#[tokio::test]
async fn decoded_ratchet_window_stays_usable() {
    let network = TestNetwork::new();

    for (seed, ratchet_window) in [(1, 0), (2, 500)] {
        let identity = format!("alice-{ratchet_window}");
        let alice = network.account(decoded_config(&identity, ratchet_window), seed);
        alice.register().await.unwrap();
        let alice_card = card(&alice, &identity).await;
        let group_id = format!("weekend-hiking-trip-{ratchet_window}");

        let others = unregistered_cards(56, &alice_card);
        let mut group = alice.create_group(&group_id, others.clone()).await.unwrap();
        let first = group.encrypt("first").await.unwrap();
        for other in &others[..55] {
            group.remove(other.clone()).await.unwrap();
        }
        assert_eq!(group.current_epoch_number(), 55);

        // Epoch 0 is long gone from the group session, the local cache still has it.
        assert_eq!(
            group.decrypt(first, &alice_card, None).await.unwrap(),
            Data::Text("first".into())
        );

        alice.manager().cache().clear().await;
        let restored = alice.get_group(&group_id).await.unwrap().unwrap();
        assert_eq!(restored.current_epoch_number(), 55);
    }
}

#[tokio::test]
async fn sender_key_rotation() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let bob = network.registered("bob", 2).await;

    let alice_group = alice
        .create_group(GROUP_ID, card(&alice, "bob").await)
        .await
        .unwrap();
    let bob_group = bob
        .load_group(GROUP_ID, &card(&bob, "alice").await)
        .await
        .unwrap();

    let encrypted = bob_group.encrypt("before rotation").await.unwrap();
    let encrypted_on = network.directory.now();

    // Bob publishes a card for a new key pair.
    let new_key_pair = NativeCrypto::from_seed([42; 32])
        .generate_key_pair()
        .unwrap();
    network
        .directory
        .publish_card("bob", &new_key_pair)
        .await
        .unwrap();

    let bob_card = card(&alice, "bob").await;
    assert_eq!(bob_card.public_key, new_key_pair.public_key);
    assert_matches!(
        alice_group.decrypt(encrypted.clone(), &bob_card, None).await,
        Err(GroupError::DataVerificationFailed)
    );
    assert_eq!(
        alice_group
            .decrypt(encrypted, &bob_card, Some(encrypted_on))
            .await
            .unwrap(),
        Data::Text("before rotation".into())
    );
}

#[tokio::test]
async fn concurrent_changes_are_rejected() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let _bob = network.registered("bob", 2).await;
    let _charlie = network.registered("charlie", 3).await;

    let mut group = alice
        .create_group(GROUP_ID, card(&alice, "bob").await)
        .await
        .unwrap();
    let mut other_handle = alice.get_group(GROUP_ID).await.unwrap().unwrap();
    let charlie_card = card(&alice, "charlie").await;

    let guard = group.latch.try_acquire().unwrap();
    assert_matches!(
        group.add(charlie_card.clone()).await,
        Err(GroupError::IllegalInvocation)
    );
    assert_matches!(
        other_handle.add(charlie_card.clone()).await,
        Err(GroupError::IllegalInvocation)
    );
    assert_matches!(
        alice.delete_group(GROUP_ID).await,
        Err(GroupError::IllegalInvocation)
    );
    drop(guard);

    other_handle.add(charlie_card).await.unwrap();
    assert_eq!(other_handle.participants().len(), 3);
}

#[tokio::test]
async fn re_add_grants_access_again() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let _bob = network.registered("bob", 2).await;
    let charlie = network.registered("charlie", 3).await;

    let group = alice
        .create_group(GROUP_ID, users(&alice, &["bob", "charlie"]).await)
        .await
        .unwrap();
    let session_id = group.session_id();
    let alice_card = card(&charlie, "alice").await;
    let charlie_card = card(&alice, "charlie").await;

    // Charlie lost cloud access, for example after losing their device.
    let key_pair = alice.manager().key_loader().key_pair().await.unwrap();
    network
        .cloud
        .connect("alice", &key_pair)
        .unwrap()
        .remove_recipient(&session_id, "charlie")
        .await
        .unwrap();
    assert_matches!(
        charlie.load_group(GROUP_ID, &alice_card).await,
        Err(GroupError::GroupNotFound)
    );

    group.re_add(&charlie_card).await.unwrap();
    assert_eq!(
        group.participants(),
        &participants(&["alice", "bob", "charlie"])
    );
    let recipients = network.cloud.recipients(&session_id, 0).await.unwrap();
    assert_eq!(recipients, participants(&["alice", "bob", "charlie"]));

    let charlie_group = charlie.load_group(GROUP_ID, &alice_card).await.unwrap();
    assert_eq!(charlie_group.session_id(), session_id);
}

#[tokio::test]
async fn delete_group() {
    let network = TestNetwork::new();
    let alice = network.registered("alice", 1).await;
    let bob = network.registered("bob", 2).await;

    let group = alice
        .create_group(GROUP_ID, card(&alice, "bob").await)
        .await
        .unwrap();
    let session_id = group.session_id();
    assert!(network.cloud.recipients(&session_id, 0).await.is_some());

    alice.delete_group(GROUP_ID).await.unwrap();
    assert!(network.cloud.recipients(&session_id, 0).await.is_none());
    assert!(alice.get_group(GROUP_ID).await.unwrap().is_none());
    assert_matches!(
        bob.load_group(GROUP_ID, &card(&bob, "alice").await).await,
        Err(GroupError::GroupNotFound)
    );
    assert_matches!(
        alice.delete_group(GROUP_ID).await,
        Err(GroupError::GroupNotFound)
    );

    let expected = NativeCrypto::new().calculate_group_session_id(GROUP_ID);
    assert_eq!(session_id, expected);
}
