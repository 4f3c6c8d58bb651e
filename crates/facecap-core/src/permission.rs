//! Camera permission gate.
//!
//! The gate starts from whatever the platform reports, allows exactly one
//! transition per explicit prompt, and never leaves `Granted` once there.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    NotRequested,
    Denied,
    Granted,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        self == Self::Granted
    }
}

/// Outcome of feeding a prompt result into the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The gate moved from `from` to `to`.
    Changed {
        from: PermissionStatus,
        to: PermissionStatus,
    },
    /// No prompt was outstanding, or the gate is already granted.
    Ignored,
}

#[derive(Debug)]
pub struct PermissionGate {
    status: PermissionStatus,
    prompt_outstanding: bool,
    prompts: u32,
}

impl PermissionGate {
    /// Gate seeded with the status read from the platform at startup.
    pub fn new(initial: PermissionStatus) -> Self {
        Self {
            status: initial,
            prompt_outstanding: false,
            prompts: 0,
        }
    }

    pub fn status(&self) -> PermissionStatus {
        self.status
    }

    pub fn is_granted(&self) -> bool {
        self.status.is_granted()
    }

    /// Number of prompts shown this session.
    pub fn prompts(&self) -> u32 {
        self.prompts
    }

    /// Record a user action asking for the prompt. Returns false when the
    /// prompt should not be shown (already granted or already waiting).
    pub fn begin_prompt(&mut self) -> bool {
        if self.is_granted() || self.prompt_outstanding {
            return false;
        }
        self.prompt_outstanding = true;
        self.prompts += 1;
        true
    }

    /// Apply the answer to the outstanding prompt.
    pub fn complete_prompt(&mut self, granted: bool) -> Transition {
        if !self.prompt_outstanding || self.is_granted() {
            return Transition::Ignored;
        }
        self.prompt_outstanding = false;

        let from = self.status;
        self.status = if granted {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        };
        Transition::Changed {
            from,
            to: self.status,
        }
    }
}
