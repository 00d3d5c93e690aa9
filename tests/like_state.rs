mod common;

use common::{comment, like, session, FakeWaline, USER_ID};
use pretty_assertions::assert_eq;
use waline_likes::{
    ClientLikeState, Freshness, LikeError, LikeStateController, LikedPaths, LocalStore,
    SessionStore, SessionUser, ToggleOutcome,
};

fn idle(count: u64, liked: bool) -> ClientLikeState {
    ClientLikeState {
        count,
        liked,
        submitting: false,
        loading: false,
    }
}

#[tokio::test]
async fn toggle_commits_the_server_count() {
    let mut fake =
        FakeWaline::start(vec![like("/posts/a", 1, "u2", "2024-01-01T00:00:00.000Z")]).await;
    fake.serve_path("/posts/a").await;
    fake.accept_token().await;
    fake.create_mock(USER_ID).create_async().await;
    fake.delete_mock().create_async().await;
    let (store, session) = session(Some(USER_ID));
    let liked_paths = LikedPaths::new(store);
    let controller =
        LikeStateController::new("/posts/a", fake.service(session), liked_paths.clone());

    assert!(controller.state().loading);
    controller.hydrate().await;
    assert_eq!(controller.state(), idle(1, false));

    let mut updates = controller.subscribe();
    let outcome = controller.toggle().await.unwrap();
    assert_eq!(outcome, ToggleOutcome::Liked { count: 2 });
    assert_eq!(controller.state(), idle(2, true));
    assert!(liked_paths.has_liked("/posts/a"));
    assert!(updates.has_changed().unwrap());
    assert_eq!(*updates.borrow_and_update(), idle(2, true));

    let outcome = controller.toggle().await.unwrap();
    assert_eq!(outcome, ToggleOutcome::Unliked { count: 1 });
    assert_eq!(controller.state(), idle(1, false));
    assert!(!liked_paths.has_liked("/posts/a"));
}

#[tokio::test]
async fn failed_toggle_restores_the_exact_prior_state() {
    let mut fake = FakeWaline::start(vec![comment("/posts/a", 1, "hi")]).await;
    fake.serve_path("/posts/a").await;
    fake.accept_token().await;
    fake.server
        .mock("POST", "/api/comment")
        .with_status(500)
        .with_body("internal error")
        .create_async()
        .await;
    let (store, session) = session(Some(USER_ID));
    let liked_paths = LikedPaths::new(store);
    let controller =
        LikeStateController::new("/posts/a", fake.service(session), liked_paths.clone());
    controller.hydrate().await;
    let before = controller.state();

    let err = controller.toggle().await.unwrap_err();
    assert!(matches!(err, LikeError::Http { .. }));
    assert_eq!(controller.state(), before);
    assert!(!liked_paths.has_liked("/posts/a"));
}

#[tokio::test]
async fn missing_count_after_like_is_a_failure() {
    let mut fake = FakeWaline::start(Vec::new()).await;
    fake.accept_token().await;
    let created = fake.create_mock(USER_ID).expect(1).create_async().await;
    // No user id, so no duplicate scan; comment reads are not served at all.
    let store = LocalStore::in_memory().unwrap();
    let session = SessionStore::new(store.clone());
    session
        .login(&SessionUser {
            token: "tok".into(),
            ..Default::default()
        })
        .unwrap();
    let liked_paths = LikedPaths::new(store);
    let service = fake.service(session);
    service.cache().set("/posts/a", 3, Freshness::Normal);
    let controller = LikeStateController::new("/posts/a", service, liked_paths.clone());
    controller.hydrate().await;
    let before = controller.state();
    assert_eq!(before, idle(3, false));

    let err = controller.toggle().await.unwrap_err();
    assert!(matches!(err, LikeError::NoData));
    assert_eq!(controller.state(), before);
    assert!(!liked_paths.has_liked("/posts/a"));
    created.assert_async().await;
}

#[tokio::test]
async fn toggle_without_session_asks_for_login() {
    let fake = FakeWaline::start(Vec::new()).await;
    let (store, session) = session(None);
    let controller =
        LikeStateController::new("/posts/a", fake.service(session), LikedPaths::new(store));
    let before = controller.state();

    let err = controller.toggle().await.unwrap_err();
    assert!(matches!(err, LikeError::LoginRequired));
    assert_eq!(controller.state(), before);
}

#[tokio::test]
async fn concurrent_toggle_is_skipped() {
    let mut fake = FakeWaline::start(Vec::new()).await;
    fake.serve_path("/posts/a").await;
    fake.accept_token().await;
    let created = fake.create_mock(USER_ID).expect(1).create_async().await;
    let (store, session) = session(Some(USER_ID));
    let controller =
        LikeStateController::new("/posts/a", fake.service(session), LikedPaths::new(store));
    controller.hydrate().await;

    let (first, second) = tokio::join!(controller.toggle(), controller.toggle());
    assert_eq!(first.unwrap(), ToggleOutcome::Liked { count: 1 });
    assert_eq!(second.unwrap(), ToggleOutcome::Skipped);
    assert_eq!(controller.state(), idle(1, true));
    created.assert_async().await;
}

#[tokio::test]
async fn server_membership_overrides_the_local_hint() {
    let mut fake =
        FakeWaline::start(vec![like("/posts/a", 1, "u2", "2024-01-01T00:00:00.000Z")]).await;
    fake.serve_path("/posts/a").await;

    let (store, session) = session(Some(USER_ID));
    let liked_paths = LikedPaths::new(store);
    liked_paths.set_liked("/posts/a");
    let controller =
        LikeStateController::new("/posts/a", fake.service(session), liked_paths.clone());
    controller.hydrate().await;
    assert_eq!(controller.state(), idle(1, false));
    assert!(!liked_paths.has_liked("/posts/a"));

    // Without a session the hint is all there is.
    let (store, anonymous) = common::session(None);
    let liked_paths = LikedPaths::new(store);
    liked_paths.set_liked("/posts/a");
    let controller = LikeStateController::new("/posts/a", fake.service(anonymous), liked_paths);
    controller.hydrate().await;
    assert_eq!(controller.state(), idle(1, true));
}

#[tokio::test]
async fn path_switch_and_unmount_drop_stale_results() {
    let mut fake = FakeWaline::start(vec![
        like("/posts/a", 1, "u2", "2024-01-01T00:00:00.000Z"),
        like("/posts/b", 2, "u2", "2024-01-01T00:00:00.000Z"),
        like("/posts/b", 3, "u3", "2024-01-01T00:00:00.000Z"),
    ])
    .await;
    fake.serve_path("/posts/a").await;
    fake.serve_path("/posts/b").await;
    let (store, session) = session(None);
    let controller =
        LikeStateController::new("/posts/a", fake.service(session), LikedPaths::new(store));

    controller.hydrate().await;
    assert_eq!(controller.state().count, 1);

    controller.set_path("/posts/b").await;
    assert_eq!(controller.path(), "/posts/b");
    assert_eq!(controller.state(), idle(2, false));

    controller.unmount();
    controller.hydrate().await;
    assert_eq!(controller.state(), idle(2, false));
}

#[tokio::test]
async fn toggle_during_hydration_keeps_the_hint_in_step() {
    let mut fake =
        FakeWaline::start(vec![like("/posts/a", 1, "u2", "2024-01-01T00:00:00.000Z")]).await;
    fake.serve_path("/posts/a").await;
    fake.accept_token().await;
    let created = fake.create_mock(USER_ID).expect(1).create_async().await;
    let (store, session) = session(Some(USER_ID));
    let liked_paths = LikedPaths::new(store);
    let controller =
        LikeStateController::new("/posts/a", fake.service(session), liked_paths.clone());

    // The membership read starts before the like and answers "not liked".
    let ((), toggled) = tokio::join!(controller.hydrate(), controller.toggle());
    assert_eq!(toggled.unwrap(), ToggleOutcome::Liked { count: 2 });
    assert_eq!(controller.state(), idle(2, true));
    assert!(liked_paths.has_liked("/posts/a"));
    created.assert_async().await;
}

#[tokio::test]
async fn path_switch_during_hydration_discards_the_old_article() {
    let mut fake = FakeWaline::start(vec![
        like("/posts/a", 1, "u2", "2024-01-01T00:00:00.000Z"),
        like("/posts/b", 2, USER_ID, "2024-01-01T00:00:00.000Z"),
        like("/posts/b", 3, "u3", "2024-01-01T00:00:00.000Z"),
    ])
    .await;
    fake.serve_path("/posts/a").await;
    fake.serve_path("/posts/b").await;
    let (store, session) = session(Some(USER_ID));
    let liked_paths = LikedPaths::new(store);
    liked_paths.set_liked("/posts/a");
    let controller =
        LikeStateController::new("/posts/a", fake.service(session), liked_paths.clone());

    // `/posts/a` is still being read when the view moves to `/posts/b`.
    tokio::join!(controller.hydrate(), controller.set_path("/posts/b"));
    assert_eq!(controller.path(), "/posts/b");
    assert_eq!(controller.state(), idle(2, true));
    assert!(liked_paths.has_liked("/posts/b"));
    // The server says `/posts/a` is not liked, but that answer came too late.
    assert!(liked_paths.has_liked("/posts/a"));
}

#[tokio::test]
async fn unmount_during_hydration_leaves_state_untouched() {
    let mut fake =
        FakeWaline::start(vec![like("/posts/a", 1, "u2", "2024-01-01T00:00:00.000Z")]).await;
    let reads = fake.path_mock("/posts/a").expect(1).create_async().await;
    let (store, session) = session(Some(USER_ID));
    let liked_paths = LikedPaths::new(store);
    liked_paths.set_liked("/posts/a");
    let controller =
        LikeStateController::new("/posts/a", fake.service(session), liked_paths.clone());

    tokio::join!(controller.hydrate(), async { controller.unmount() });
    // Only the local hint landed before the view went away.
    assert_eq!(
        controller.state(),
        ClientLikeState {
            liked: true,
            ..Default::default()
        }
    );
    assert!(liked_paths.has_liked("/posts/a"));
    reads.assert_async().await;
}
