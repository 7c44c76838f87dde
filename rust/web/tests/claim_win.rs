use chrono::{Duration, Utc};
use tavern_engine::game::{GameKind, GameOptions};
use tavern_engine::session::{EndReason, SessionStatus};
use tavern_engine::MoveError;
use tavern_web::server::AppContext;
use tavern_web::session::SessionError;
use tavern_web::store::{keys, KeyValueStore};

fn started(context: &AppContext) {
    context
        .sessions()
        .create_session(
            Some("pub-quiz".to_string()),
            GameKind::TicTacToe,
            GameOptions::default(),
            vec![
                ("ann".to_string(), "Ann".to_string()),
                ("ben".to_string(), "Ben".to_string()),
            ],
        )
        .expect("create session");
}

fn last_seen(context: &AppContext, who: &str, seconds_ago: i64) {
    context
        .sessions()
        .tracker()
        .heartbeat_at("pub-quiz", who, Utc::now() - Duration::seconds(seconds_ago))
        .expect("heartbeat");
}

#[test]
fn claim_succeeds_after_sixteen_silent_seconds() {
    let context = AppContext::new_for_tests();
    started(&context);
    last_seen(&context, "ann", 0);
    last_seen(&context, "ben", 16);

    let view = context
        .sessions()
        .claim_win("pub-quiz", "ann")
        .expect("claim accepted");
    assert_eq!(view.status, SessionStatus::Completed);
    assert_eq!(view.result.as_ref().and_then(|r| r.winner()), Some("ann"));
    assert_eq!(
        view.end_reason,
        Some(EndReason::ClaimWin {
            participant_id: "ann".to_string()
        })
    );
}

#[test]
fn claim_is_refused_after_ten_silent_seconds() {
    let context = AppContext::new_for_tests();
    started(&context);
    last_seen(&context, "ann", 0);
    last_seen(&context, "ben", 10);

    let err = context
        .sessions()
        .claim_win("pub-quiz", "ann")
        .expect_err("opponent still within the window");
    assert!(matches!(err, SessionError::Move(MoveError::NotEligible(_))));
    assert_eq!(
        context.sessions().load("pub-quiz").unwrap().status,
        SessionStatus::Active
    );
}

#[test]
fn reconnect_before_the_claim_defeats_it() {
    let context = AppContext::new_for_tests();
    started(&context);
    last_seen(&context, "ben", 30);

    assert!(context
        .sessions()
        .heartbeat("pub-quiz", "ben")
        .expect("heartbeat"));
    assert!(matches!(
        context.sessions().claim_win("pub-quiz", "ann"),
        Err(SessionError::Move(MoveError::NotEligible(_)))
    ));
}

/// Moves the session's creation time into the past so the never-heartbeated
/// fallback cannot mask how a detached participant is measured.
fn backdate(context: &AppContext, seconds: i64) {
    let mut session = context.sessions().load("pub-quiz").expect("load");
    session.created_at = session.created_at - Duration::seconds(seconds);
    context
        .store()
        .set(
            &keys::session("pub-quiz"),
            serde_json::to_string(&session).expect("encode"),
            std::time::Duration::from_secs(3600),
        )
        .expect("store");
}

#[tokio::test]
async fn a_dropped_stream_does_not_make_its_owner_claimable() {
    let context = AppContext::new_for_tests();
    started(&context);
    backdate(&context, 60);
    last_seen(&context, "ann", 0);

    let stream = context
        .gateway()
        .attach_session("pub-quiz", Some("ben"))
        .expect("attach");
    drop(stream);
    assert!(!context.sessions().tracker().is_live("pub-quiz", "ben").unwrap());

    assert!(matches!(
        context.sessions().claim_win("pub-quiz", "ann"),
        Err(SessionError::Move(MoveError::NotEligible(_)))
    ));
    assert_eq!(
        context.sessions().load("pub-quiz").unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test]
async fn a_detached_participant_becomes_claimable_once_silent_long_enough() {
    let context = AppContext::new_for_tests();
    started(&context);
    backdate(&context, 60);
    last_seen(&context, "ben", 20);
    assert!(context.sessions().leave("pub-quiz", "ben").expect("leave"));

    let view = context
        .sessions()
        .claim_win("pub-quiz", "ann")
        .expect("claim accepted");
    assert_eq!(view.result.as_ref().and_then(|r| r.winner()), Some("ann"));
}

#[test]
fn claims_only_come_from_participants_of_live_sessions() {
    let context = AppContext::new_for_tests();
    started(&context);
    last_seen(&context, "ben", 60);

    assert!(matches!(
        context.sessions().claim_win("pub-quiz", "zed"),
        Err(SessionError::AccessDenied { .. })
    ));

    context.sessions().forfeit("pub-quiz", "ann").expect("forfeit");
    assert!(matches!(
        context.sessions().claim_win("pub-quiz", "ann"),
        Err(SessionError::Move(MoveError::InvalidState { .. }))
    ));
}
