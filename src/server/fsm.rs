//! Orchestrator state machine.
//!
//! Same shape as the client FSM: a pure transition table consumed by the
//! runtime in `server::RmacsServer`. The hopping loop is expressed as the
//! PARTIAL_FREQUENCY_HOPPING <-> SEND_CHANNEL_SWITCH_REQUEST cycle, one
//! iteration per entry into the hopping state.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    PartialFrequencyHopping,
    SendChannelSwitchRequest,
    UpdateFreqHoppingSequence,
    BroadcastOperatingFreq,
    ResetClientMessages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    BadChannelQualityIndex,
    ChannelQualityReport,
    ChannelSwitchRequest,
    ChannelSwitchRequestSent,
    PeriodicOperatingFreqBroadcast,
    BroadcastComplete,
    ChannelQualityUpdateComplete,
    FrequencyHoppingComplete,
}

/// Work the runtime performs on entering a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    PartialFrequencyHopping,
    IngestReports,
    BroadcastOperatingFreq,
    SendSwitchRequest,
}

/// The complete orchestrator transition table.
pub fn transition(
    state: ServerState,
    event: ServerEvent,
) -> Option<(ServerState, Option<ServerAction>)> {
    use ServerAction as A;
    use ServerEvent as E;
    use ServerState as S;

    match (state, event) {
        (S::Idle, E::BadChannelQualityIndex) => {
            Some((S::PartialFrequencyHopping, Some(A::PartialFrequencyHopping)))
        }
        (S::Idle, E::ChannelQualityReport) => {
            Some((S::UpdateFreqHoppingSequence, Some(A::IngestReports)))
        }
        (S::Idle, E::PeriodicOperatingFreqBroadcast) => {
            Some((S::BroadcastOperatingFreq, Some(A::BroadcastOperatingFreq)))
        }
        (S::UpdateFreqHoppingSequence, E::ChannelQualityUpdateComplete) => Some((S::Idle, None)),
        (S::BroadcastOperatingFreq, E::BroadcastComplete) => Some((S::Idle, None)),
        (S::PartialFrequencyHopping, E::ChannelSwitchRequest) => {
            Some((S::SendChannelSwitchRequest, Some(A::SendSwitchRequest)))
        }
        (S::SendChannelSwitchRequest, E::ChannelSwitchRequestSent) => {
            Some((S::PartialFrequencyHopping, Some(A::PartialFrequencyHopping)))
        }
        (S::PartialFrequencyHopping, E::FrequencyHoppingComplete) => Some((S::Idle, None)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hopping_cycle_alternates_with_switch_requests() {
        use ServerEvent as E;
        use ServerState as S;

        let (next, action) = transition(S::Idle, E::BadChannelQualityIndex).unwrap();
        assert_eq!(next, S::PartialFrequencyHopping);
        assert_eq!(action, Some(ServerAction::PartialFrequencyHopping));

        let (next, action) = transition(next, E::ChannelSwitchRequest).unwrap();
        assert_eq!(next, S::SendChannelSwitchRequest);
        assert_eq!(action, Some(ServerAction::SendSwitchRequest));

        let (next, action) = transition(next, E::ChannelSwitchRequestSent).unwrap();
        assert_eq!(next, S::PartialFrequencyHopping);
        assert_eq!(action, Some(ServerAction::PartialFrequencyHopping));

        let (next, action) = transition(next, E::FrequencyHoppingComplete).unwrap();
        assert_eq!(next, S::Idle);
        assert_eq!(action, None);
    }

    #[test]
    fn reports_and_broadcasts_return_to_idle() {
        use ServerEvent as E;
        use ServerState as S;

        let (next, _) = transition(S::Idle, E::ChannelQualityReport).unwrap();
        assert_eq!(next, S::UpdateFreqHoppingSequence);
        let (next, _) = transition(next, E::ChannelQualityUpdateComplete).unwrap();
        assert_eq!(next, S::Idle);

        let (next, _) = transition(S::Idle, E::PeriodicOperatingFreqBroadcast).unwrap();
        assert_eq!(next, S::BroadcastOperatingFreq);
        let (next, _) = transition(next, E::BroadcastComplete).unwrap();
        assert_eq!(next, S::Idle);
    }

    #[test]
    fn hopping_cannot_start_outside_idle() {
        assert!(
            transition(
                ServerState::BroadcastOperatingFreq,
                ServerEvent::BadChannelQualityIndex
            )
            .is_none()
        );
    }
}
