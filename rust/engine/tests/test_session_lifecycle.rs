use tavern_engine::errors::MoveError;
use tavern_engine::game::{GameKind, GameOptions, Move};
use tavern_engine::session::{self, EndReason, Outcome, Session, SessionStatus};

fn tic_tac_toe(best_of: u32) -> Session {
    let players = vec![
        ("ann".to_string(), "Ann".to_string()),
        ("ben".to_string(), "Ben".to_string()),
    ];
    let options = GameOptions {
        best_of,
        ..GameOptions::default()
    };
    session::start(&Session::new("series", GameKind::TicTacToe, options, players).unwrap())
        .unwrap()
}

fn mark(state: &Session, who: &str, position: usize) -> Session {
    session::validate_and_apply(state, who, &Move::Mark { position })
        .expect("legal move")
        .0
}

#[test]
fn best_of_three_starts_a_new_round_until_majority() {
    let mut state = tic_tac_toe(3);

    // Round 1: ann takes the top row.
    for (who, pos) in [("ann", 0), ("ben", 3), ("ann", 1), ("ben", 4)] {
        state = mark(&state, who, pos);
    }
    let (next, result) =
        session::validate_and_apply(&state, "ann", &Move::Mark { position: 2 }).unwrap();
    state = next;

    let round = result.round.expect("round decided");
    assert_eq!(round.round, 1);
    assert_eq!(round.outcome.winner(), Some("ann"));
    assert!(!result.completed);
    assert_eq!(state.status, SessionStatus::Active);
    assert_eq!(state.series.round, 2);
    assert_eq!(state.series.wins, vec![1, 0]);
    // Fresh board, and the second round is opened by ben.
    assert_eq!(state.current_participant().unwrap().id, "ben");

    // Round 2: ben opens, ann takes the left column.
    for (who, pos) in [("ben", 4), ("ann", 0), ("ben", 8), ("ann", 3), ("ben", 2)] {
        state = mark(&state, who, pos);
    }
    let (state, result) =
        session::validate_and_apply(&state, "ann", &Move::Mark { position: 6 }).unwrap();

    assert!(result.completed);
    assert_eq!(state.series.wins, vec![2, 0]);
    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(state.end_reason, Some(EndReason::Finished));
    assert_eq!(state.result.as_ref().and_then(Outcome::winner), Some("ann"));
}

#[test]
fn forfeit_hands_the_win_to_the_opponent() {
    let state = tic_tac_toe(1);
    let done = session::forfeit(&state, "ben").unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.result.as_ref().and_then(Outcome::winner), Some("ann"));
    assert_eq!(
        done.end_reason,
        Some(EndReason::Forfeit {
            participant_id: "ben".to_string()
        })
    );
}

#[test]
fn claim_win_requires_every_opponent_absent() {
    let state = tic_tac_toe(1);

    let err = session::claim_win(&state, "ann", &[]).unwrap_err();
    assert!(matches!(err, MoveError::NotEligible(_)));

    let done = session::claim_win(&state, "ann", &["ben".to_string()]).unwrap();
    assert_eq!(done.status, SessionStatus::Completed);
    assert_eq!(done.result.as_ref().and_then(Outcome::winner), Some("ann"));
}

#[test]
fn first_terminal_action_wins_the_race() {
    let state = tic_tac_toe(1);
    let forfeited = session::forfeit(&state, "ann").unwrap();

    // A move or claim computed against the now-stale state is refused once
    // re-validated against the committed one.
    let err = session::validate_and_apply(&forfeited, "ann", &Move::Mark { position: 0 })
        .unwrap_err();
    assert_eq!(
        err,
        MoveError::InvalidState {
            status: SessionStatus::Completed
        }
    );
    assert!(session::claim_win(&forfeited, "ben", &["ann".to_string()]).is_err());
}

#[test]
fn abandon_records_reason_without_result() {
    let state = tic_tac_toe(1);
    let gone = session::abandon(&state, "both left").unwrap();
    assert_eq!(gone.status, SessionStatus::Abandoned);
    assert!(gone.result.is_none());
    assert!(matches!(gone.end_reason, Some(EndReason::Abandoned { .. })));
}
