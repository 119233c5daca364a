//! Keyboard/mouse event demultiplexing, per spec.md §6.4.
//!
//! Translates raw input (as an embedding GUI toolkit would deliver it)
//! into the small set of [`Action`]s the rest of the display client
//! reacts to. Kept independent of any concrete windowing crate, same
//! boundary as [`crate::display::driver::Renderer`].

use crate::display::driver::{Direction, Step};

/// A physical key this client recognizes, independent of any GUI
/// toolkit's own key enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// Escape.
    Esc,
    /// `?`.
    Question,
    /// `s` or `S`.
    CycleGraph,
    /// Arrow keys.
    ArrowLeft,
    /// Arrow keys.
    ArrowRight,
    /// Home.
    Home,
    /// End.
    End,
    /// `+` or `=`.
    ZoomIn,
    /// `-`.
    ZoomOut,
    /// `1`.
    YScale1,
    /// `2`.
    YScale2,
    /// Ctrl-P.
    Screenshot,
}

/// Modifier keys held alongside a [`Key`] press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Modifiers {
    /// Ctrl held.
    pub ctrl: bool,
    /// Alt held.
    pub alt: bool,
}

/// The effect a recognized key event has on the client, per spec.md
/// §6.4's event table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// `Esc`.
    Quit,
    /// `?`.
    ShowAbout,
    /// `s`/`S`.
    CycleGraph,
    /// An arrow key, resolved to a cursor step.
    StepCursor(Direction, Step),
    /// `Home`.
    JumpHome,
    /// `End`.
    JumpEnd,
    /// `+`/`-`/`=`.
    ScaleX(XScale),
    /// `1`/`2`.
    ScaleY(YScale),
    /// Ctrl-P.
    Screenshot,
}

/// X-axis (time) scale adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XScale {
    /// `+`/`=`.
    In,
    /// `-`.
    Out,
}

/// Y-axis scale preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YScale {
    /// `1`.
    Preset1,
    /// `2`.
    Preset2,
}

/// Maps one key press (with modifiers) to the [`Action`] it produces.
/// Returns `None` for a key this client doesn't bind.
pub fn dispatch(key: Key, modifiers: Modifiers) -> Option<Action> {
    let step = if modifiers.ctrl {
        Step::Ctrl
    } else if modifiers.alt {
        Step::Alt
    } else {
        Step::Arrow
    };

    Some(match key {
        Key::Esc => Action::Quit,
        Key::Question => Action::ShowAbout,
        Key::CycleGraph => Action::CycleGraph,
        Key::ArrowLeft => Action::StepCursor(Direction::Backward, step),
        Key::ArrowRight => Action::StepCursor(Direction::Forward, step),
        Key::Home => Action::JumpHome,
        Key::End => Action::JumpEnd,
        Key::ZoomIn => Action::ScaleX(XScale::In),
        Key::ZoomOut => Action::ScaleX(XScale::Out),
        Key::YScale1 => Action::ScaleY(YScale::Preset1),
        Key::YScale2 => Action::ScaleY(YScale::Preset2),
        Key::Screenshot => Action::Screenshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_arrow_steps_one_second() {
        let action = dispatch(Key::ArrowRight, Modifiers::default()).unwrap();
        assert_eq!(
            action,
            Action::StepCursor(Direction::Forward, Step::Arrow)
        );
    }

    #[test]
    fn ctrl_arrow_steps_ten_seconds() {
        let action = dispatch(
            Key::ArrowLeft,
            Modifiers {
                ctrl: true,
                alt: false,
            },
        )
        .unwrap();
        assert_eq!(action, Action::StepCursor(Direction::Backward, Step::Ctrl));
    }

    #[test]
    fn alt_arrow_steps_sixty_seconds() {
        let action = dispatch(
            Key::ArrowRight,
            Modifiers {
                ctrl: false,
                alt: true,
            },
        )
        .unwrap();
        assert_eq!(action, Action::StepCursor(Direction::Forward, Step::Alt));
    }

    #[test]
    fn esc_quits() {
        assert_eq!(
            dispatch(Key::Esc, Modifiers::default()),
            Some(Action::Quit)
        );
    }

    #[test]
    fn ctrl_p_is_screenshot() {
        assert_eq!(
            dispatch(
                Key::Screenshot,
                Modifiers {
                    ctrl: true,
                    alt: false
                }
            ),
            Some(Action::Screenshot)
        );
    }
}
