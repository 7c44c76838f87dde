//! # tavern-engine: turn-based game rules
//!
//! Pure, synchronous rules for the two-party (or small-group) games hosted in
//! the tavern lobby, plus the authoritative [`session::Session`] record they
//! mutate. Nothing in this crate performs I/O; storage, fanout and liveness
//! live in `tavern_web`.
//!
//! ## Core Modules
//!
//! - [`game`] - Game kinds, options, boards, moves and the [`game::GameRules`] plugin trait
//! - [`tictactoe`] - Line-completion rules on a 3×3 grid
//! - [`dots_and_boxes`] - Enclosure-completion rules on a W×H dot grid
//! - [`session`] - Session record, status machine, best-of-N series and terminal actions
//! - [`errors`] - Move validation errors
//!
//! ## Quick Start
//!
//! ```rust
//! use tavern_engine::game::{GameKind, GameOptions, Move};
//! use tavern_engine::session::{self, Session, SessionStatus};
//!
//! let players = vec![
//!     ("ann".to_string(), "Ann".to_string()),
//!     ("ben".to_string(), "Ben".to_string()),
//! ];
//! let waiting = Session::new("demo", GameKind::TicTacToe, GameOptions::default(), players)
//!     .expect("valid setup");
//! let mut state = session::start(&waiting).expect("start");
//!
//! for (who, cell) in [("ann", 0), ("ben", 3), ("ann", 1), ("ben", 4), ("ann", 2)] {
//!     let (next, _) = session::validate_and_apply(&state, who, &Move::Mark { position: cell })
//!         .expect("legal move");
//!     state = next;
//! }
//!
//! assert_eq!(state.status, SessionStatus::Completed);
//! assert_eq!(state.result.as_ref().and_then(|r| r.winner()), Some("ann"));
//! ```

pub mod dots_and_boxes;
pub mod errors;
pub mod game;
pub mod session;
pub mod tictactoe;

pub use errors::MoveError;
pub use game::{Board, GameKind, GameOptions, GameRules, Move, Orientation};
pub use session::{Outcome, Participant, Session, SessionStatus};
