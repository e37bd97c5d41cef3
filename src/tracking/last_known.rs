use super::{Provider, RawFix};

/// Secondary fixes only replace the cached position when the latest primary
/// fix is older than this
const PRIMARY_FIX_MAX_AGE_MS: i64 = 10_000;

/// Cache of the most recent position for display purposes. Fed by every fix
/// with usable coordinates, whatever its accuracy or provider, and never
/// consulted by trip logic.
#[derive(Clone, Debug, Default)]
pub struct LastKnownPosition {
    fix: Option<RawFix>,
    last_primary_ms: Option<i64>,
}

impl LastKnownPosition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fix(&self) -> Option<&RawFix> {
        self.fix.as_ref()
    }

    pub fn update(&mut self, fix: &RawFix) {
        if !fix.position().is_valid() {
            return;
        }
        if self
            .fix
            .as_ref()
            .is_some_and(|current| fix.timestamp_ms < current.timestamp_ms)
        {
            return;
        }

        match fix.provider {
            Provider::Primary => {
                self.last_primary_ms = Some(fix.timestamp_ms);
            }
            Provider::Secondary => {
                if self
                    .last_primary_ms
                    .is_some_and(|last| fix.timestamp_ms - last <= PRIMARY_FIX_MAX_AGE_MS)
                {
                    return;
                }
            }
        }
        self.fix = Some(fix.clone());
    }
}
