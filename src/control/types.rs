//! Control message types and wire encoding
//!
//! Messages are written as one opcode byte followed by big-endian fields.
//! There is no length prefix; the opcode implies the layout.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ControlError, ControlResult};
use crate::video::Resolution;

/// Longest text accepted by `InjectText`, in bytes
pub const MAX_TEXT_LENGTH: usize = 300;

/// Largest message the server reads in one go
const MAX_MESSAGE_SIZE: usize = 1 << 18;

/// Longest clipboard text accepted by `SetClipboard`, in bytes
///
/// The opcode, paste flag and length prefix share the server buffer.
pub const MAX_CLIPBOARD_LENGTH: usize = MAX_MESSAGE_SIZE - 6;

/// Pointer id used for mouse-style touches
pub const POINTER_ID_MOUSE: i64 = -1;

/// Full pressure in 16-bit fixed point
pub const PRESSURE_MAX: u16 = 0xFFFF;

/// Primary mouse button
pub const BUTTON_PRIMARY: i32 = 1;

mod opcode {
    pub const INJECT_KEYCODE: u8 = 0;
    pub const INJECT_TEXT: u8 = 1;
    pub const INJECT_TOUCH: u8 = 2;
    pub const INJECT_SCROLL: u8 = 3;
    pub const BACK_OR_SCREEN_ON: u8 = 4;
    pub const EXPAND_NOTIFICATION_PANEL: u8 = 5;
    pub const EXPAND_SETTINGS_PANEL: u8 = 6;
    pub const COLLAPSE_PANELS: u8 = 7;
    pub const SET_CLIPBOARD: u8 = 9;
    pub const SET_SCREEN_POWER_MODE: u8 = 10;
    pub const ROTATE_DEVICE: u8 = 11;
}

/// Key and touch actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    /// Press
    Down = 0,
    /// Release
    Up = 1,
    /// Pointer movement while pressed
    Move = 2,
}

/// Screen power modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PowerMode {
    /// Display off, mirroring continues
    Off = 0,
    /// Display on
    Normal = 2,
}

/// Android key codes
pub mod keycode {
    /// Home
    pub const HOME: i32 = 3;
    /// Back
    pub const BACK: i32 = 4;
    /// Digit 0; digits follow in order
    pub const DIGIT_0: i32 = 7;
    /// Letter A; letters follow in order
    pub const A: i32 = 29;
    /// Tab
    pub const TAB: i32 = 61;
    /// Space
    pub const SPACE: i32 = 62;
    /// Left shift
    pub const SHIFT_LEFT: i32 = 59;
    /// Enter
    pub const ENTER: i32 = 66;
    /// Backspace
    pub const DEL: i32 = 67;
    /// Menu
    pub const MENU: i32 = 82;
    /// Left control
    pub const CTRL_LEFT: i32 = 113;
    /// Power
    pub const POWER: i32 = 26;
    /// Volume up
    pub const VOLUME_UP: i32 = 24;
    /// Volume down
    pub const VOLUME_DOWN: i32 = 25;
    /// Recent apps
    pub const APP_SWITCH: i32 = 187;

    /// Maps a typed character to its key code
    ///
    /// Covers digits, ASCII letters (case-insensitive), space, enter and
    /// tab. Anything else should be sent as text.
    pub fn for_char(c: char) -> Option<i32> {
        match c {
            '0'..='9' => Some(DIGIT_0 + (c as i32 - '0' as i32)),
            'a'..='z' => Some(A + (c as i32 - 'a' as i32)),
            'A'..='Z' => Some(A + (c as i32 - 'A' as i32)),
            ' ' => Some(SPACE),
            '\n' | '\r' => Some(ENTER),
            '\t' => Some(TAB),
            _ => None,
        }
    }
}

/// A control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Key press or release
    InjectKeycode {
        /// Down or up
        action: Action,
        /// Android key code
        keycode: i32,
        /// Repeat count
        repeat: i32,
        /// Modifier state
        metastate: i32,
    },
    /// Text typed as a whole
    ///
    /// Build it with `ControlMessage::text`; `validate` rejects text over
    /// `MAX_TEXT_LENGTH` bytes.
    InjectText(String),
    /// Touch or mouse pointer event
    InjectTouch {
        /// Down, up or move
        action: Action,
        /// Pointer id, `POINTER_ID_MOUSE` for the mouse
        pointer_id: i64,
        /// X in device pixels
        x: i32,
        /// Y in device pixels
        y: i32,
        /// Screen size the coordinates refer to
        screen: Resolution,
        /// Pressure in 16-bit fixed point
        pressure: u16,
        /// Pressed buttons
        buttons: i32,
    },
    /// Scroll at a position
    InjectScroll {
        /// X in device pixels
        x: i32,
        /// Y in device pixels
        y: i32,
        /// Screen size the coordinates refer to
        screen: Resolution,
        /// Horizontal amount
        hscroll: i32,
        /// Vertical amount
        vscroll: i32,
    },
    /// Back, or turn the screen on if it is off
    BackOrScreenOn(Action),
    /// Pull down the notification panel
    ExpandNotificationPanel,
    /// Pull down the quick settings panel
    ExpandSettingsPanel,
    /// Close open panels
    CollapsePanels,
    /// Replace the device clipboard
    ///
    /// Build it with `ControlMessage::set_clipboard`; `validate` rejects
    /// text over `MAX_CLIPBOARD_LENGTH` bytes.
    SetClipboard {
        /// Also paste into the focused field
        paste: bool,
        /// New clipboard content
        text: String,
    },
    /// Turn the display on or off
    SetScreenPowerMode(PowerMode),
    /// Rotate the device
    RotateDevice,
}

impl ControlMessage {
    /// Builds a key message without repeat or modifiers
    pub fn keycode(action: Action, keycode: i32) -> Self {
        Self::InjectKeycode {
            action,
            keycode,
            repeat: 0,
            metastate: 0,
        }
    }

    /// Builds a full-pressure mouse touch, clamping negative coordinates
    pub fn touch(action: Action, x: i32, y: i32, screen: Resolution) -> Self {
        Self::InjectTouch {
            action,
            pointer_id: POINTER_ID_MOUSE,
            x: x.max(0),
            y: y.max(0),
            screen,
            pressure: PRESSURE_MAX,
            buttons: BUTTON_PRIMARY,
        }
    }

    /// Builds a scroll message, clamping negative coordinates
    pub fn scroll(x: i32, y: i32, screen: Resolution, hscroll: i32, vscroll: i32) -> Self {
        Self::InjectScroll {
            x: x.max(0),
            y: y.max(0),
            screen,
            hscroll,
            vscroll,
        }
    }

    /// Builds a text message
    ///
    /// # Errors
    ///
    /// Returns `ControlError::TextTooLong` beyond `MAX_TEXT_LENGTH` bytes
    pub fn text(text: impl Into<String>) -> ControlResult<Self> {
        let text = text.into();
        check_length(&text, MAX_TEXT_LENGTH)?;
        Ok(Self::InjectText(text))
    }

    /// Builds a clipboard message
    ///
    /// # Errors
    ///
    /// Returns `ControlError::TextTooLong` beyond `MAX_CLIPBOARD_LENGTH` bytes
    pub fn set_clipboard(text: impl Into<String>, paste: bool) -> ControlResult<Self> {
        let text = text.into();
        check_length(&text, MAX_CLIPBOARD_LENGTH)?;
        Ok(Self::SetClipboard { paste, text })
    }

    /// Checks that variable-length payloads fit the server limits
    ///
    /// # Errors
    ///
    /// Returns `ControlError::TextTooLong` for oversized text or clipboard
    /// content
    pub fn validate(&self) -> ControlResult<()> {
        match self {
            Self::InjectText(text) => check_length(text, MAX_TEXT_LENGTH),
            Self::SetClipboard { text, .. } => check_length(text, MAX_CLIPBOARD_LENGTH),
            _ => Ok(()),
        }
    }

    /// Returns the wire opcode
    pub fn opcode(&self) -> u8 {
        match self {
            Self::InjectKeycode { .. } => opcode::INJECT_KEYCODE,
            Self::InjectText(_) => opcode::INJECT_TEXT,
            Self::InjectTouch { .. } => opcode::INJECT_TOUCH,
            Self::InjectScroll { .. } => opcode::INJECT_SCROLL,
            Self::BackOrScreenOn(_) => opcode::BACK_OR_SCREEN_ON,
            Self::ExpandNotificationPanel => opcode::EXPAND_NOTIFICATION_PANEL,
            Self::ExpandSettingsPanel => opcode::EXPAND_SETTINGS_PANEL,
            Self::CollapsePanels => opcode::COLLAPSE_PANELS,
            Self::SetClipboard { .. } => opcode::SET_CLIPBOARD,
            Self::SetScreenPowerMode(_) => opcode::SET_SCREEN_POWER_MODE,
            Self::RotateDevice => opcode::ROTATE_DEVICE,
        }
    }

    /// Encodes the message
    ///
    /// Does not check payload lengths; see `validate`.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.opcode());

        match self {
            Self::InjectKeycode {
                action,
                keycode,
                repeat,
                metastate,
            } => {
                buf.put_u8(*action as u8);
                buf.put_i32(*keycode);
                buf.put_i32(*repeat);
                buf.put_i32(*metastate);
            }
            Self::InjectText(text) => put_string(&mut buf, text),
            Self::InjectTouch {
                action,
                pointer_id,
                x,
                y,
                screen,
                pressure,
                buttons,
            } => {
                buf.put_u8(*action as u8);
                buf.put_i64(*pointer_id);
                put_position(&mut buf, *x, *y, *screen);
                buf.put_u16(*pressure);
                buf.put_i32(*buttons);
            }
            Self::InjectScroll {
                x,
                y,
                screen,
                hscroll,
                vscroll,
            } => {
                put_position(&mut buf, *x, *y, *screen);
                buf.put_i32(*hscroll);
                buf.put_i32(*vscroll);
            }
            Self::BackOrScreenOn(action) => buf.put_u8(*action as u8),
            Self::SetClipboard { paste, text } => {
                buf.put_u8(u8::from(*paste));
                put_string(&mut buf, text);
            }
            Self::SetScreenPowerMode(mode) => buf.put_u8(*mode as u8),
            Self::ExpandNotificationPanel
            | Self::ExpandSettingsPanel
            | Self::CollapsePanels
            | Self::RotateDevice => {}
        }

        buf.freeze()
    }
}

fn check_length(text: &str, max: usize) -> ControlResult<()> {
    if text.len() > max {
        return Err(ControlError::TextTooLong {
            len: text.len(),
            max,
        });
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, text: &str) {
    // Validated payloads are far below i32::MAX
    buf.put_u32(u32::try_from(text.len()).unwrap_or(u32::MAX));
    buf.put_slice(text.as_bytes());
}

fn put_position(buf: &mut BytesMut, x: i32, y: i32, screen: Resolution) {
    buf.put_i32(x);
    buf.put_i32(y);
    buf.put_u16(clamp_u16(screen.width));
    buf.put_u16(clamp_u16(screen.height));
}

fn clamp_u16(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}
