use std::sync::Arc;

use assert_matches::assert_matches;

use crate::ballot::{Ballot, BallotConfig, BallotHash, BallotKind};
use crate::error::AssemblyError;
use crate::harvest::state::verify_ballots;
use crate::harvest::{Harvest, HarvestResult, HarvestState, RelayStep};
use crate::identity::Me;
use crate::registry::ProofCache;
use crate::tests::{cache_for, members};
use crate::types::{Fingerprint, Question};

struct Round {
    members: Vec<Arc<Me>>,
    proofs: ProofCache,
    harvest: Harvest,
    states: Vec<HarvestState>,
}

fn participants(round: &Round) -> Vec<Fingerprint> {
    round.harvest.participants.clone()
}

/// Every member committed and confirmed the harvest.
fn committed_round(question: Option<Question>, ballots: Vec<Ballot>) -> Round {
    let members = members(ballots.len());
    let proofs = cache_for("assembly-1", &members);
    let harvest = Harvest::new("h-1", question.clone(), members.iter().map(|m| m.fingerprint().clone()));

    let states = members
        .iter()
        .zip(ballots)
        .map(|(me, ballot)| {
            let mut state = HarvestState::new(me.clone(), "h-1", question.clone());
            state.set_ballot(ballot).unwrap();
            state.set_harvest(harvest.clone()).unwrap();
            state
        })
        .collect();

    Round { members, proofs, harvest, states }
}

fn relay_hashes(round: &mut Round) -> Vec<BallotHash> {
    let order = participants(round);
    let mut hashes = Vec::new();
    for i in 0..order.len() {
        hashes = match round.states[i].next_hash(hashes, order[i + 1..].to_vec()).unwrap() {
            RelayStep::Forward { to, items, .. } => {
                assert_eq!(to, order[i + 1]);
                items
            }
            RelayStep::Broadcast(items) => items,
        };
    }
    hashes
}

fn relay_ballots(round: &mut Round) -> Vec<Ballot> {
    let order = participants(round);
    let mut ballots = Vec::new();
    for i in 0..order.len() {
        ballots = match round.states[i].next_ballot(ballots, order[i + 1..].to_vec()).unwrap() {
            RelayStep::Forward { items, .. } | RelayStep::Broadcast(items) => items,
        };
    }
    ballots
}

fn validate_all(round: &mut Round, hashes: &[BallotHash]) -> Vec<(Fingerprint, String)> {
    for state in &mut round.states {
        state.set_hashes(hashes.to_vec()).unwrap();
    }
    round
        .members
        .iter()
        .zip(&round.states)
        .map(|(me, state)| (me.fingerprint().clone(), state.my_validation().unwrap()))
        .collect()
}

fn closed_ballots(answers: &[bool]) -> Vec<Ballot> {
    let config = BallotConfig::default();
    answers.iter().map(|a| Ballot::closed(*a, &config).unwrap()).collect()
}

#[test]
fn test_three_member_closed_harvest() {
    let mut round = committed_round(Some(Question::closed("Pizza?")), closed_ballots(&[true, false, true]));

    let hashes = relay_hashes(&mut round);
    assert_eq!(hashes.len(), 3);
    let mut sorted = hashes.clone();
    sorted.sort();
    assert_eq!(hashes, sorted);

    let signatures = validate_all(&mut round, &hashes);
    for state in &mut round.states {
        state.set_validations(&signatures, &round.proofs).unwrap();
    }

    let revealed = relay_ballots(&mut round);
    for state in &mut round.states {
        let result = state.set_ballots(revealed.clone()).unwrap();
        assert_eq!(result, &HarvestResult::Closed { yes: 2, no: 1 });
        assert!(state.is_finished());
    }
}

#[test]
fn test_shuffled_reveal_gives_same_result() {
    let config = BallotConfig::default();
    let ballots = ["north", "south", "east"].iter().map(|a| Ballot::open(*a, &config).unwrap()).collect();
    let mut round = committed_round(Some(Question::open("Which exit?")), ballots);

    let hashes = relay_hashes(&mut round);
    let signatures = validate_all(&mut round, &hashes);
    for state in &mut round.states {
        state.set_validations(&signatures, &round.proofs).unwrap();
    }
    let revealed = relay_ballots(&mut round);
    let mut reversed = revealed.clone();
    reversed.reverse();

    let first = round.states[0].set_ballots(revealed).unwrap().clone();
    let second = round.states[1].set_ballots(reversed).unwrap().clone();
    assert_eq!(first, second);
    assert_eq!(first, HarvestResult::Open { answers: vec!["east".into(), "north".into(), "south".into()] });
}

#[test]
fn test_proposal_harvest_collects_questions() {
    let config = BallotConfig::default();
    let ballots = vec![
        Ballot::question(Some(Question::closed("Vote on budget?")), &config).unwrap(),
        Ballot::question(None, &config).unwrap(),
    ];
    let mut round = committed_round(None, ballots);

    let hashes = relay_hashes(&mut round);
    let signatures = validate_all(&mut round, &hashes);
    for state in &mut round.states {
        state.set_validations(&signatures, &round.proofs).unwrap();
    }
    let revealed = relay_ballots(&mut round);

    let result = round.states[0].set_ballots(revealed).unwrap();
    assert_eq!(result, &HarvestResult::Questions { questions: vec![Question::closed("Vote on budget?")] });
}

#[test]
fn test_censored_hash_detected_by_owner() {
    let mut round = committed_round(Some(Question::closed("?")), closed_ballots(&[true, true, false]));
    let mut hashes = relay_hashes(&mut round);

    let own = round.states[0].ballot().unwrap().hash().unwrap();
    hashes.retain(|h| *h != own);
    hashes.push(Ballot::closed(true, &BallotConfig::default()).unwrap().hash().unwrap());

    assert_matches!(round.states[0].set_hashes(hashes.clone()), Err(AssemblyError::Censorship(_)));
    assert!(round.states[1].set_hashes(hashes).is_ok());
}

#[test]
fn test_hash_set_of_wrong_size_rejected() {
    let mut round = committed_round(Some(Question::closed("?")), closed_ballots(&[true, false]));
    let mut hashes = relay_hashes(&mut round);
    hashes.push(hashes[0].clone());

    assert_matches!(round.states[0].set_hashes(hashes.clone()), Err(AssemblyError::Censorship(_)));
    assert_matches!(round.states[1].set_hashes(hashes), Err(AssemblyError::Censorship(_)));
}

#[test]
fn test_missing_validation_names_participant() {
    let mut round = committed_round(Some(Question::closed("?")), closed_ballots(&[true, false, false]));
    let hashes = relay_hashes(&mut round);
    let mut signatures = validate_all(&mut round, &hashes);
    let (silent, _) = signatures.remove(2);

    assert_matches!(
        round.states[0].set_validations(&signatures, &round.proofs),
        Err(AssemblyError::Validation(fp)) if fp == silent
    );
}

#[test]
fn test_duplicate_validation_rejected() {
    let mut round = committed_round(Some(Question::closed("?")), closed_ballots(&[true, false]));
    let hashes = relay_hashes(&mut round);
    let mut signatures = validate_all(&mut round, &hashes);
    signatures.push(signatures[1].clone());

    assert_matches!(
        round.states[0].set_validations(&signatures, &round.proofs),
        Err(AssemblyError::Validation(_))
    );
}

#[test]
fn test_forged_validation_rejected() {
    let mut round = committed_round(Some(Question::closed("?")), closed_ballots(&[true, false]));
    let hashes = relay_hashes(&mut round);
    let mut signatures = validate_all(&mut round, &hashes);
    // member 1 signs in member 0's name
    signatures[0].1 = signatures[1].1.clone();
    let forged = signatures[0].0.clone();

    assert_matches!(
        round.states[1].set_validations(&signatures, &round.proofs),
        Err(AssemblyError::Validation(fp)) if fp == forged
    );
}

#[test]
fn test_hash_order_does_not_change_signed_proof() {
    let mut round = committed_round(Some(Question::closed("?")), closed_ballots(&[true, false]));
    let hashes = relay_hashes(&mut round);
    validate_all(&mut round, &hashes);

    let mut other = HarvestState::new(round.members[0].clone(), "h-1", Some(Question::closed("?")));
    other.set_ballot(round.states[0].ballot().unwrap().clone()).unwrap();
    other.set_harvest(round.harvest.clone()).unwrap();
    let mut reversed = hashes;
    reversed.reverse();
    other.set_hashes(reversed).unwrap();

    assert_eq!(other.proof_bytes().unwrap(), round.states[0].proof_bytes().unwrap());
}

#[test]
fn test_reveal_must_match_commitments() {
    let ballots = closed_ballots(&[true, false, true]);
    let hashes: Vec<BallotHash> = ballots.iter().map(|b| b.hash().unwrap()).collect();
    let stranger = Ballot::closed(true, &BallotConfig::default()).unwrap();
    let kind = BallotKind::ClosedAnswer;

    assert!(verify_ballots(kind, &hashes, &ballots).is_ok());

    let substituted = vec![ballots[0].clone(), ballots[1].clone(), stranger];
    assert_matches!(verify_ballots(kind, &hashes, &substituted), Err(AssemblyError::Mismatch(_)));

    let duplicated = vec![ballots[0].clone(), ballots[0].clone(), ballots[1].clone()];
    assert_matches!(verify_ballots(kind, &hashes, &duplicated), Err(AssemblyError::Mismatch(_)));

    let omitted = vec![ballots[0].clone(), ballots[1].clone()];
    assert_matches!(verify_ballots(kind, &hashes, &omitted), Err(AssemblyError::Mismatch(_)));

    assert_matches!(
        verify_ballots(BallotKind::OpenAnswer, &hashes, &ballots),
        Err(AssemblyError::Mismatch(_))
    );
}

#[test]
fn test_steps_cannot_be_replayed_or_skipped() {
    let mut round = committed_round(Some(Question::closed("?")), closed_ballots(&[true, false]));
    let config = BallotConfig::default();

    assert_matches!(
        round.states[0].set_ballot(Ballot::closed(false, &config).unwrap()),
        Err(AssemblyError::ProtocolState(_))
    );
    assert_matches!(round.states[0].set_harvest(round.harvest.clone()), Err(AssemblyError::ProtocolState(_)));
    assert_matches!(round.states[0].next_ballot(Vec::new(), Vec::new()), Err(AssemblyError::ProtocolState(_)));
    assert_matches!(round.states[0].set_ballots(Vec::new()), Err(AssemblyError::ProtocolState(_)));

    let order = participants(&round);
    round.states[0].next_hash(Vec::new(), order[1..].to_vec()).unwrap();
    assert_matches!(
        round.states[0].next_hash(Vec::new(), order[1..].to_vec()),
        Err(AssemblyError::ProtocolState(_))
    );
}

#[test]
fn test_ballot_kind_must_fit_question() {
    let me = Arc::new(Me::generate("alice").unwrap());
    let mut state = HarvestState::new(me, "h-1", Some(Question::closed("?")));
    let open = Ballot::open("maybe", &BallotConfig::default()).unwrap();

    assert_matches!(
        state.set_ballot(open),
        Err(AssemblyError::KindMismatch { expected: BallotKind::ClosedAnswer, actual: BallotKind::OpenAnswer })
    );
}

#[test]
fn test_wrong_harvest_rejected() {
    let everyone = members(2);
    let question = Some(Question::closed("?"));
    let ballot = Ballot::closed(true, &BallotConfig::default()).unwrap();

    let mut state = HarvestState::new(everyone[0].clone(), "h-1", question.clone());
    assert_matches!(
        state.set_harvest(Harvest::new("h-1", question.clone(), vec![everyone[0].fingerprint().clone()])),
        Err(AssemblyError::ProtocolState(_))
    );
    state.set_ballot(ballot).unwrap();

    let all = || everyone.iter().map(|m| m.fingerprint().clone());
    assert_matches!(state.set_harvest(Harvest::new("h-2", question.clone(), all())), Err(AssemblyError::WrongHarvest(_)));
    assert_matches!(
        state.set_harvest(Harvest::new("h-1", Some(Question::closed("other")), all())),
        Err(AssemblyError::WrongHarvest(_))
    );
    assert_matches!(
        state.set_harvest(Harvest::new("h-1", question.clone(), vec![everyone[1].fingerprint().clone()])),
        Err(AssemblyError::WrongHarvest(_))
    );
    assert!(state.set_harvest(Harvest::new("h-1", question, all())).is_ok());
}
