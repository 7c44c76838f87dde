use tavern_engine::errors::MoveError;
use tavern_engine::game::{Board, GameKind, GameOptions, Move, Orientation};
use tavern_engine::session::{self, Outcome, Session, SessionStatus};

fn h(row: usize, col: usize) -> Move {
    Move::Line {
        orientation: Orientation::Horizontal,
        row,
        col,
    }
}

fn v(row: usize, col: usize) -> Move {
    Move::Line {
        orientation: Orientation::Vertical,
        row,
        col,
    }
}

fn game(width: u8, height: u8) -> Session {
    let players = vec![
        ("a".to_string(), "Ann".to_string()),
        ("b".to_string(), "Ben".to_string()),
    ];
    let options = GameOptions {
        width: Some(width),
        height: Some(height),
        ..GameOptions::default()
    };
    session::start(&Session::new("dots", GameKind::DotsAndBoxes, options, players).unwrap())
        .unwrap()
}

fn step(state: &Session, who: &str, mv: Move) -> Session {
    session::validate_and_apply(state, who, &mv)
        .expect("legal move")
        .0
}

#[test]
fn fourth_side_scores_one_and_grants_extra_turn() {
    let mut state = game(4, 4);
    state = step(&state, "a", h(0, 0));
    state = step(&state, "b", h(1, 0));
    state = step(&state, "a", v(0, 0));

    let (state, result) = session::validate_and_apply(&state, "b", &v(0, 1)).unwrap();
    assert_eq!(result.points, 1);
    assert!(result.extra_turn);
    assert_eq!(state.scores, vec![0, 1]);
    assert_eq!(state.current_participant().unwrap().id, "b");

    let Board::DotsAndBoxes(grid) = &state.board else {
        panic!("expected a dot grid")
    };
    assert_eq!(grid.cell_owner(0, 0), Some(1));
}

#[test]
fn shared_edge_closes_two_cells() {
    let mut state = game(4, 4);
    for (who, mv) in [
        ("a", h(0, 0)),
        ("b", h(1, 0)),
        ("a", v(0, 0)),
        ("b", h(0, 1)),
        ("a", h(1, 1)),
        ("b", v(0, 2)),
    ] {
        state = step(&state, who, mv);
    }
    assert_eq!(state.scores, vec![0, 0]);
    assert_eq!(state.current_participant().unwrap().id, "a");

    let (state, result) = session::validate_and_apply(&state, "a", &v(0, 1)).unwrap();
    assert_eq!(result.points, 2);
    assert!(result.extra_turn);
    assert_eq!(state.scores, vec![2, 0]);
    assert_eq!(state.current_participant().unwrap().id, "a");
}

#[test]
fn drawn_segment_cannot_be_drawn_again() {
    let state = step(&game(4, 4), "a", h(2, 1));
    let err = session::validate_and_apply(&state, "b", &h(2, 1)).unwrap_err();
    assert!(matches!(err, MoveError::PositionTaken { .. }));
}

#[test]
fn wrong_move_shape_is_rejected() {
    let state = game(4, 4);
    let err = session::validate_and_apply(&state, "a", &Move::Mark { position: 0 }).unwrap_err();
    assert!(matches!(err, MoveError::WrongMove(_)));
}

#[test]
fn single_cell_game_ends_with_higher_score_winning() {
    // 2x2 dots: one cell, four segments.
    let mut state = game(2, 2);
    state = step(&state, "a", h(0, 0));
    state = step(&state, "b", h(1, 0));
    state = step(&state, "a", v(0, 0));
    let (state, result) = session::validate_and_apply(&state, "b", &v(0, 1)).unwrap();

    assert!(result.completed);
    assert!(!result.extra_turn);
    assert_eq!(state.status, SessionStatus::Completed);
    assert_eq!(
        state.result,
        Some(Outcome::Winner {
            participant_id: "b".to_string()
        })
    );
}

#[test]
fn rectangular_grid_with_equal_scores_is_a_draw() {
    // 3x2 dots: two cells side by side.
    let mut state = game(3, 2);
    // a closes the left cell, b closes the right one.
    for (who, mv) in [
        ("a", h(0, 0)),
        ("b", h(1, 0)),
        ("a", v(0, 0)),
        ("b", h(0, 1)),
        ("a", v(0, 1)),
    ] {
        state = step(&state, who, mv);
    }
    assert_eq!(state.scores, vec![1, 0]);
    // a keeps the turn after scoring.
    state = step(&state, "a", h(1, 1));
    let (state, result) = session::validate_and_apply(&state, "b", &v(0, 2)).unwrap();

    assert!(result.completed);
    assert_eq!(state.result, Some(Outcome::Draw));
}
