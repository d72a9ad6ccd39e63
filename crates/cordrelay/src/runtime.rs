//! Session runtime seam.
//!
//! The game server owns player state and the display primitives. The relay
//! only touches them from the cooperative domain, so the trait takes
//! `&mut self` and is not required to be thread-safe.

/// Transient player slot index; reused after a player leaves.
pub type Slot = u32;

/// A player that can receive HUD and chat output. Identified by slot.
pub type RecipientId = Slot;

/// Output and occupancy primitives provided by the session runtime.
pub trait SessionRuntime {
    /// Print a line to every player's chat.
    fn broadcast_text(&mut self, text: &str);

    /// Draw `html` in the center of one player's screen for a single frame.
    fn render_transient(&mut self, recipient: RecipientId, html: &str);

    /// Connected, non-bot players right now.
    fn eligible_recipients(&self) -> Vec<RecipientId>;

    /// Whether `recipient` is still connected and eligible.
    fn is_recipient_valid(&self, recipient: RecipientId) -> bool;

    /// Server capacity, for status lines.
    fn max_occupants(&self) -> u32;
}
