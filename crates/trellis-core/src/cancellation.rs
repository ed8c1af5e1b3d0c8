// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User and system cancellation.

use tokio_util::sync::CancellationToken;

/// Which token requested cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationSource {
    /// The caller gave up on the operation
    User,
    /// Infrastructure forced an abort (shutdown, explicit cancel)
    System,
}

/// A pair of independently cancellable tokens. Cancelled if either is.
///
/// The scheduler only looks at these between activities, never while one runs.
#[derive(Debug, Clone, Default)]
pub struct CancellationTokens {
    /// Cancelled by the caller
    pub user: CancellationToken,
    /// Cancelled by infrastructure
    pub system: CancellationToken,
}

impl CancellationTokens {
    /// Fresh, uncancelled tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing tokens.
    pub fn from_tokens(user: CancellationToken, system: CancellationToken) -> Self {
        Self { user, system }
    }

    /// Whether either token is cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.source().is_some()
    }

    /// The token that fired, system first.
    pub fn source(&self) -> Option<CancellationSource> {
        if self.system.is_cancelled() {
            Some(CancellationSource::System)
        } else if self.user.is_cancelled() {
            Some(CancellationSource::User)
        } else {
            None
        }
    }

    /// Tokens for one scheduler run. The system side is a child, so cancelling it
    /// stops this run without touching the caller's token.
    pub(crate) fn scoped(&self) -> Self {
        Self {
            user: self.user.clone(),
            system: self.system.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_either_token_cancels() {
        let tokens = CancellationTokens::new();
        assert!(!tokens.is_cancelled());

        tokens.user.cancel();
        assert_eq!(tokens.source(), Some(CancellationSource::User));

        let tokens = CancellationTokens::new();
        tokens.system.cancel();
        assert_eq!(tokens.source(), Some(CancellationSource::System));
    }

    #[test]
    fn test_scoped_system_token_is_a_child() {
        let outer = CancellationTokens::new();
        let run = outer.scoped();

        run.system.cancel();
        assert!(run.is_cancelled());
        assert!(!outer.is_cancelled());

        let outer = CancellationTokens::new();
        let run = outer.scoped();
        outer.system.cancel();
        assert!(run.is_cancelled());
    }
}
