//! Candidate list construction and application selection.
//!
//! Candidates come from two directions, per EMV Book 1, §12.3: walking the
//! Payment System Environment directory when the card has one, and probing
//! the terminal's own AID list with SELECT by DF name. Both feed one
//! candidate list ordered by the Application Priority Indicator; the
//! embedder (or its cardholder prompt) picks an index, and we SELECT it.

use tracing::warn;

use crate::apdu::{Response, StatusClass};
use crate::ber;
use crate::errors::{Error, Outcome, Result};
use crate::reader::CardReader;
use crate::tags;
use crate::tlv::{Tlv, TlvList};
use crate::ttl::Ttl;

/// Contact Payment System Environment DF name.
pub const PSE_NAME: &[u8] = b"1PAY.SYS.DDF01";
/// Contactless Payment System Environment DF name.
pub const PPSE_NAME: &[u8] = b"2PAY.SYS.DDF01";

/// How a terminal-configured AID matches on-card applications
/// (the Application Selection Indicator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asi {
    /// The card DF name must equal the configured AID.
    Exact,
    /// Any card DF name extending the configured AID matches.
    Partial,
}

/// One entry of the terminal's supported-AID list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalAid {
    pub aid: Vec<u8>,
    pub asi: Asi,
}

impl TerminalAid {
    pub fn exact<T: Into<Vec<u8>>>(aid: T) -> Self {
        Self { aid: aid.into(), asi: Asi::Exact }
    }

    pub fn partial<T: Into<Vec<u8>>>(aid: T) -> Self {
        Self { aid: aid.into(), asi: Asi::Partial }
    }

    fn matches(&self, card_aid: &[u8]) -> bool {
        match self.asi {
            Asi::Exact => self.aid == card_aid,
            Asi::Partial => card_aid.starts_with(&self.aid),
        }
    }
}

/// A mutually supported application, not yet selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidate {
    pub aid: Vec<u8>,
    pub label: Option<String>,
    /// Application Priority Indicator, low nibble: 1 (highest) to 15,
    /// 0 when the card did not specify one.
    pub priority: u8,
    /// Bit 8 of the priority indicator: cardholder confirmation required.
    pub needs_confirmation: bool,
    pub preferred_name: Option<Vec<u8>>,
    pub lang_pref: Option<String>,
    pub code_table: Option<u8>,
    /// Issuer discretionary data from the directory entry or FCI, opaque.
    pub discretionary: Option<Vec<u8>>,
}

/// The application the transaction will run against, built from the FCI of
/// the final SELECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedApp {
    pub aid: Vec<u8>,
    pub df_name: Vec<u8>,
    pub label: Option<String>,
    pub priority: u8,
    /// Bit 8 of the priority indicator: cardholder confirmation required.
    pub needs_confirmation: bool,
    pub pdol: Option<Vec<u8>>,
    pub lang_pref: Option<String>,
    pub preferred_name: Option<Vec<u8>>,
    pub code_table: Option<u8>,
    /// FCI issuer discretionary data (BF0C), opaque.
    pub discretionary: Option<Vec<u8>>,
    /// The FCI proprietary template's fields, in card order.
    pub fci: TlvList,
}

impl SelectedApp {
    /// Parses a SELECT response FCI (template 6F).
    pub fn from_fci(aid: &[u8], data: &[u8]) -> Result<Self> {
        let mut app = Self {
            aid: aid.to_vec(),
            df_name: Vec::new(),
            label: None,
            priority: 0,
            needs_confirmation: false,
            pdol: None,
            lang_pref: None,
            preferred_name: None,
            code_table: None,
            discretionary: None,
            fci: TlvList::new(),
        };
        let (fci, used) = ber::decode_one(data).map_err(|_| Error::from(Outcome::CardError))?;
        if fci.tag != tags::FCI_TEMPLATE || used != data.len() {
            return Err(Outcome::CardError.into());
        }
        for item in ber::iter(fci.value) {
            let view = item.map_err(|_| Error::from(Outcome::CardError))?;
            match view.tag {
                tags::DF_NAME => app.df_name = view.value.to_vec(),
                tags::FCI_PROPRIETARY => app.parse_proprietary(view.value)?,
                _ => {
                    warn!("unexpected field in FCI: {:X}", view.tag);
                    app.fci.push(Tlv::from_view(&view));
                }
            }
        }
        if app.df_name.is_empty() {
            return Err(Outcome::CardError.into());
        }
        Ok(app)
    }

    fn parse_proprietary(&mut self, data: &[u8]) -> Result<()> {
        for item in ber::iter(data) {
            let view = item.map_err(|_| Error::from(Outcome::CardError))?;
            match view.tag {
                tags::APP_LABEL => {
                    self.label = Some(crate::fields::format::to_ans(view.value));
                }
                tags::APP_PRIORITY => {
                    let b = view.value.first().copied().unwrap_or(0);
                    self.priority = b & 0x0F;
                    self.needs_confirmation = b & 0x80 != 0;
                }
                tags::PDOL => self.pdol = Some(view.value.to_vec()),
                tags::LANGUAGE_PREFERENCE => {
                    self.lang_pref = Some(crate::fields::format::to_an(view.value));
                }
                tags::ISSUER_CODE_TABLE => self.code_table = view.value.first().copied(),
                tags::APP_PREFERRED_NAME => self.preferred_name = Some(view.value.to_vec()),
                tags::FCI_DISCRETIONARY => self.discretionary = Some(view.value.to_vec()),
                _ => {}
            }
            self.fci.push(Tlv::from_view(&view));
        }
        Ok(())
    }
}

/// Builds the candidate list. The PSE (or PPSE for contactless) is walked
/// first; terminal AIDs not discovered there are probed directly. An empty
/// `terminal_aids` list accepts every application the card offers, which is
/// useful for exploration tools but not how a payment terminal runs.
pub fn build_candidates<R: CardReader>(
    ttl: &mut Ttl<R>,
    terminal_aids: &[TerminalAid],
    contactless: bool,
) -> Result<Vec<Candidate>> {
    let mut found: Vec<Candidate> = Vec::new();

    let pse_name = if contactless { PPSE_NAME } else { PSE_NAME };
    let res = ttl.select_first(pse_name)?;
    match res.sw.class() {
        StatusClass::Ok | StatusClass::Warning(_) => {
            if contactless {
                collect_ppse_fci(&res, terminal_aids, &mut found)?;
            } else {
                collect_pse_directory(ttl, &res, terminal_aids, &mut found)?;
            }
        }
        StatusClass::FunctionNotSupported => return Err(Outcome::CardBlocked.into()),
        // No directory (or a blocked one): fall back to the AID list.
        _ => warn!(sw = %res.sw, "payment system environment unavailable"),
    }

    for taid in terminal_aids {
        if found.iter().any(|c| taid.matches(&c.aid)) {
            continue;
        }
        discover_aid(ttl, taid, &mut found)?;
    }

    // Ascending priority, unspecified (0) last, discovery order preserved
    // within a rank.
    found.sort_by_key(|c| if c.priority == 0 { 0x10 } else { c.priority });
    Ok(found)
}

/// Reads the PSE directory file record by record, collecting application
/// templates until the card reports no more records.
fn collect_pse_directory<R: CardReader>(
    ttl: &mut Ttl<R>,
    select_res: &Response,
    terminal_aids: &[TerminalAid],
    found: &mut Vec<Candidate>,
) -> Result<()> {
    let mut fci = TlvList::new();
    if crate::tlv::parse_all(&mut fci, &select_res.data).is_err() {
        return Err(Outcome::CardError.into());
    }
    let Some(&[sfi]) = fci.get_value(tags::PSE_SFI) else {
        return Err(Outcome::CardError.into());
    };
    if !(1..=30).contains(&sfi) {
        return Err(Outcome::CardError.into());
    }

    for record in 1..=u8::MAX {
        let res = ttl.read_record(sfi, record)?;
        match res.sw.class() {
            StatusClass::Ok => {}
            StatusClass::RecordNotFound => break,
            _ => return Err(Outcome::CardError.into()),
        }
        let (rec, _) = ber::decode_one(&res.data).map_err(|_| Error::from(Outcome::CardError))?;
        if rec.tag != tags::RECORD_TEMPLATE {
            return Err(Outcome::CardError.into());
        }
        for entry in ber::iter(rec.value) {
            let view = entry.map_err(|_| Error::from(Outcome::CardError))?;
            if view.tag != tags::APP_TEMPLATE {
                warn!("unexpected entry in PSE record: {:X}", view.tag);
                continue;
            }
            if let Some(c) = candidate_from_template(view.value)? {
                push_candidate(found, terminal_aids, c);
            }
        }
    }
    Ok(())
}

/// Contactless PPSE: application templates come straight back in the FCI's
/// issuer discretionary data.
fn collect_ppse_fci(
    select_res: &Response,
    terminal_aids: &[TerminalAid],
    found: &mut Vec<Candidate>,
) -> Result<()> {
    let (fci, _) =
        ber::decode_one(&select_res.data).map_err(|_| Error::from(Outcome::CardError))?;
    if fci.tag != tags::FCI_TEMPLATE {
        return Err(Outcome::CardError.into());
    }
    for item in ber::iter(fci.value) {
        let view = item.map_err(|_| Error::from(Outcome::CardError))?;
        if view.tag != tags::FCI_PROPRIETARY {
            continue;
        }
        for inner in ber::iter(view.value) {
            let inner = inner.map_err(|_| Error::from(Outcome::CardError))?;
            if inner.tag != tags::FCI_DISCRETIONARY {
                continue;
            }
            for entry in ber::iter(inner.value) {
                let entry = entry.map_err(|_| Error::from(Outcome::CardError))?;
                if entry.tag == tags::APP_TEMPLATE {
                    if let Some(c) = candidate_from_template(entry.value)? {
                        push_candidate(found, terminal_aids, c);
                    }
                }
            }
        }
    }
    Ok(())
}

fn candidate_from_template(data: &[u8]) -> Result<Option<Candidate>> {
    let mut aid = None;
    let mut c = Candidate::default();
    for item in ber::iter(data) {
        let view = item.map_err(|_| Error::from(Outcome::CardError))?;
        match view.tag {
            tags::AID => aid = Some(view.value.to_vec()),
            tags::APP_LABEL => c.label = Some(crate::fields::format::to_ans(view.value)),
            tags::APP_PRIORITY => {
                let b = view.value.first().copied().unwrap_or(0);
                c.priority = b & 0x0F;
                c.needs_confirmation = b & 0x80 != 0;
            }
            tags::APP_PREFERRED_NAME => c.preferred_name = Some(view.value.to_vec()),
            tags::LANGUAGE_PREFERENCE => {
                c.lang_pref = Some(crate::fields::format::to_an(view.value))
            }
            tags::ISSUER_CODE_TABLE => c.code_table = view.value.first().copied(),
            tags::DIRECTORY_DISCRETIONARY => c.discretionary = Some(view.value.to_vec()),
            _ => {}
        }
    }
    match aid {
        Some(aid) if (5..=16).contains(&aid.len()) => {
            c.aid = aid;
            Ok(Some(c))
        }
        Some(_) => Ok(None),
        None => {
            warn!("directory entry without an AID");
            Ok(None)
        }
    }
}

fn push_candidate(found: &mut Vec<Candidate>, terminal_aids: &[TerminalAid], c: Candidate) {
    if !terminal_aids.is_empty() && !terminal_aids.iter().any(|t| t.matches(&c.aid)) {
        return;
    }
    if found.iter().any(|f| f.aid == c.aid) {
        return;
    }
    found.push(c);
}

/// Probes one terminal AID with SELECT, iterating occurrences for partial
/// matching.
fn discover_aid<R: CardReader>(
    ttl: &mut Ttl<R>,
    taid: &TerminalAid,
    found: &mut Vec<Candidate>,
) -> Result<()> {
    let mut first = true;
    loop {
        let res = if first {
            ttl.select_first(&taid.aid)?
        } else {
            ttl.select_next(&taid.aid)?
        };
        match res.sw.class() {
            StatusClass::Ok | StatusClass::Warning(_) => {}
            StatusClass::FunctionNotSupported if first => return Err(Outcome::CardBlocked.into()),
            // Blocked application: not a candidate, maybe more occurrences.
            StatusClass::SelectedFileDeactivated if taid.asi == Asi::Partial => {
                first = false;
                continue;
            }
            _ => return Ok(()),
        }
        let app = match SelectedApp::from_fci(&taid.aid, &res.data) {
            Ok(app) => app,
            Err(e) => {
                warn!(error = %e, "undecodable FCI during AID discovery");
                return Ok(());
            }
        };
        if taid.matches(&app.df_name) {
            push_candidate(
                found,
                std::slice::from_ref(taid),
                Candidate {
                    aid: app.df_name.clone(),
                    label: app.label.clone(),
                    priority: app.priority,
                    needs_confirmation: app.needs_confirmation,
                    preferred_name: app.preferred_name.clone(),
                    lang_pref: app.lang_pref.clone(),
                    code_table: app.code_table,
                    discretionary: app.discretionary.clone(),
                },
            );
        }
        if taid.asi == Asi::Exact {
            return Ok(());
        }
        first = false;
    }
}

/// Selects the candidate at `index`. A candidate the card turns down is
/// removed from the list: the caller retries on [`Outcome::TryAgain`] and
/// gives up on [`Outcome::NotAccepted`].
pub fn select_candidate<R: CardReader>(
    ttl: &mut Ttl<R>,
    candidates: &mut Vec<Candidate>,
    index: usize,
) -> Result<SelectedApp> {
    if index >= candidates.len() {
        return Err(Error::InvalidArgument("candidate index out of range"));
    }
    let res = ttl.select_first(&candidates[index].aid)?;
    match res.sw.class() {
        StatusClass::Ok | StatusClass::Warning(_) => {
            let aid = candidates[index].aid.clone();
            SelectedApp::from_fci(&aid, &res.data)
        }
        _ => {
            warn!(sw = %res.sw, "candidate not accepted by the card");
            candidates.remove(index);
            if candidates.is_empty() {
                Err(Outcome::NotAccepted.into())
            } else {
                Err(Outcome::TryAgain.into())
            }
        }
    }
}
