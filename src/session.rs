//! The transaction orchestrator and its context.
//!
//! A [`Session`] owns everything one transaction needs: the four TLV lists
//! (`config`, `params`, `terminal`, `icc`), the offline-authentication
//! context, the selected application and the TVR/TSI bitfields. Operations
//! run strictly forward through [`State`]; each checks where it stands
//! before touching the card. One session serves one reader; the CAPK table
//! and the RSA primitive are shared, read-only service handles.
//!
//! The flow and its status-word handling follow EMV Book 3, §10, with the
//! offline data authentication procedures from Book 2.

use tracing::{debug, warn};

use crate::apdu::{StatusClass, RAPDU_MAX};
use crate::atr;
use crate::ber;
use crate::capk::CapkTable;
use crate::cert::{self, IccPublicKey};
use crate::crypto::{self, HashAlgo, ModExp};
use crate::dol;
use crate::errors::{Error, Outcome, Result};
use crate::fields::{afl, date};
use crate::reader::CardReader;
use crate::select::{self, Candidate, SelectedApp, TerminalAid};
use crate::status::{Tsi, TsiBit, Tvr, TvrBit};
use crate::tags;
use crate::tlv::{self, Tlv, TlvList};
use crate::ttl::{AcSignature, AcType, Ttl};

/// Where a transaction stands. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    AtrValidated,
    CandidatesBuilt,
    AppSelected,
    GpoDone,
    RecordsRead,
    OdaDone,
    RestrictionsDone,
    Terminated,
}

/// The offline data authentication method settled on for this transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdaMethod {
    None,
    Static,
    Dynamic,
    Combined,
}

/// Working storage for offline data authentication: the record buffer the
/// certificate hashes are rebuilt over, plus the material combined
/// authentication needs again at GENERATE AC time.
#[derive(Debug, Default)]
pub(crate) struct OdaContext {
    method: Option<OdaMethod>,
    records: Vec<u8>,
    cap: usize,
    pdol_data: Vec<u8>,
    cdol1_data: Vec<u8>,
    genac_without_sdad: Vec<u8>,
    icc_key: Option<IccPublicKey>,
}

impl OdaContext {
    fn reset(&mut self, oda_records: usize) {
        *self = OdaContext::default();
        self.cap = RAPDU_MAX * (oda_records + 2);
        self.records = Vec::with_capacity(self.cap);
    }

    /// The buffer is sized once from the AFL; outgrowing it means the card
    /// sent more authentication data than it announced.
    fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.records.len() + data.len() > self.cap {
            return Err(Error::InvalidRecord);
        }
        self.records.extend_from_slice(data);
        Ok(())
    }
}

/// The result of the first GENERATE AC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenAc {
    /// Cryptogram Information Data (9F27).
    pub cid: u8,
    /// Application Transaction Counter (9F36).
    pub atc: [u8; 2],
    /// Application Cryptogram; absent when combined authentication failed.
    pub cryptogram: Option<[u8; 8]>,
    /// Issuer Application Data (9F10), forwarded opaquely.
    pub iad: Option<Vec<u8>>,
}

pub struct Session<'e, R: CardReader> {
    ttl: Ttl<R>,
    capk: &'e CapkTable,
    crypto: &'e dyn ModExp,

    /// Default terminal behaviour (capabilities, country, default DDOL...).
    pub config: TlvList,
    /// Per-transaction parameters (amount, currency, date, type). Overrides
    /// `config` wherever both carry a tag.
    pub params: TlvList,
    /// Fields created during the transaction (Unpredictable Number, TVR,
    /// TSI, PoS entry mode).
    pub terminal: TlvList,
    /// Fields returned by the card and derived from them.
    pub icc: TlvList,

    state: State,
    contactless: bool,
    candidates: Vec<Candidate>,
    selected: Option<SelectedApp>,
    tvr: Tvr,
    tsi: Tsi,
    oda: OdaContext,
}

impl<'e, R: CardReader> Session<'e, R> {
    pub fn new(reader: R, capk: &'e CapkTable, crypto: &'e dyn ModExp, config: TlvList) -> Self {
        let mut s = Self {
            ttl: Ttl::new(reader),
            capk,
            crypto,
            config,
            params: TlvList::new(),
            terminal: TlvList::new(),
            icc: TlvList::new(),
            state: State::Init,
            contactless: false,
            candidates: Vec::new(),
            selected: None,
            tvr: Tvr::default(),
            tsi: Tsi::default(),
            oda: OdaContext::default(),
        };
        s.seed_terminal();
        s
    }

    /// Clears all per-transaction state, keeping the reader, the service
    /// handles and the configuration. Call between transactions.
    pub fn reset(&mut self, params: TlvList) {
        self.params = params;
        self.terminal.clear();
        self.icc.clear();
        self.candidates.clear();
        self.selected = None;
        self.tvr = Tvr::default();
        self.tsi = Tsi::default();
        self.oda = OdaContext::default();
        self.state = State::Init;
        self.seed_terminal();
    }

    /// Selects the contactless environment (PPSE) for candidate building.
    pub fn set_contactless(&mut self, contactless: bool) {
        self.contactless = contactless;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn tvr(&self) -> &Tvr {
        &self.tvr
    }

    pub fn tsi(&self) -> &Tsi {
        &self.tsi
    }

    pub fn selected_app(&self) -> Option<&SelectedApp> {
        self.selected.as_ref()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn oda_method(&self) -> Option<OdaMethod> {
        self.oda.method
    }

    fn seed_terminal(&mut self) {
        self.terminal.set(tags::TVR, self.tvr.as_bytes().to_vec());
        self.terminal.set(tags::TSI, self.tsi.as_bytes().to_vec());
    }

    /// Rewrites the TVR/TSI entries in the terminal list after mutation, so
    /// DOL building always sees the current bits.
    fn sync_status(&mut self) {
        self.terminal.set(tags::TVR, self.tvr.as_bytes().to_vec());
        self.terminal.set(tags::TSI, self.tsi.as_bytes().to_vec());
    }

    fn require(&self, expected: State) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::State { expected, actual: self.state })
        }
    }

    /// Terminal-side lookup: transaction parameters override transaction
    /// fields override configuration.
    fn lookup(&self, tag: ber::Tag) -> Option<&[u8]> {
        self.params
            .get_value(tag)
            .or_else(|| self.terminal.get_value(tag))
            .or_else(|| self.config.get_value(tag))
    }

    fn sources(&self) -> [&TlvList; 3] {
        [&self.params, &self.terminal, &self.config]
    }

    // ---- ATR ------------------------------------------------------------

    /// Validates the Answer-to-Reset against the EMV acceptance rules. The
    /// reset itself (and PPS, if any) already happened in the reader.
    pub fn validate_atr(&mut self, atr_bytes: &[u8]) -> Result<()> {
        self.require(State::Init)?;
        let parsed = match atr::parse(atr_bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "ATR rejected");
                return Err(Outcome::CardError.into());
            }
        };
        if let Err(e) = atr::validate_emv(&parsed) {
            warn!(error = %e, "ATR rejected");
            return Err(Outcome::CardError.into());
        }
        self.state = State::AtrValidated;
        Ok(())
    }

    // ---- Application selection ------------------------------------------

    pub fn build_candidates(&mut self, terminal_aids: &[TerminalAid]) -> Result<&[Candidate]> {
        self.require(State::AtrValidated)?;
        let found = select::build_candidates(&mut self.ttl, terminal_aids, self.contactless)?;
        if found.is_empty() {
            return Err(Outcome::NotAccepted.into());
        }
        self.candidates = found;
        self.state = State::CandidatesBuilt;
        Ok(&self.candidates)
    }

    /// Selects the candidate at `index` (zero-based, in priority order). On
    /// [`Outcome::TryAgain`] the candidate was dropped and the session stays
    /// ready for another attempt.
    pub fn select_application(&mut self, index: usize) -> Result<&SelectedApp> {
        self.require(State::CandidatesBuilt)?;
        let app = select::select_candidate(&mut self.ttl, &mut self.candidates, index)?;
        self.icc.put(tags::AID, app.df_name.clone());
        self.state = State::AppSelected;
        Ok(self.selected.insert(app))
    }

    // ---- GET PROCESSING OPTIONS -----------------------------------------

    pub fn gpo(&mut self) -> Result<()> {
        self.require(State::AppSelected)?;
        let pdol = self.selected.as_ref().and_then(|a| a.pdol.clone());
        let data = match pdol {
            Some(pdol) => dol::build_vec(&pdol, &self.sources())?,
            None => Vec::new(),
        };
        let res = self.ttl.get_processing_options(&data)?;
        match res.sw.class() {
            StatusClass::Ok => {}
            StatusClass::ConditionsNotSatisfied => return Err(Outcome::GpoNotAccepted.into()),
            _ => {
                warn!(sw = %res.sw, "GET PROCESSING OPTIONS refused");
                return Err(Outcome::CardError.into());
            }
        }
        self.oda.pdol_data = data;

        let (tmpl, used) =
            ber::decode_one(&res.data).map_err(|_| Error::from(Outcome::CardError))?;
        if used != res.data.len() {
            return Err(Outcome::CardError.into());
        }
        match tmpl.tag {
            // Format 1: AIP and AFL concatenated in one primitive value.
            tags::RESPONSE_FORMAT1 => {
                if tmpl.value.len() < 6 || (tmpl.value.len() - 2) % 4 != 0 {
                    return Err(Outcome::CardError.into());
                }
                self.icc.put(tags::AIP, &tmpl.value[..2]);
                self.icc.put(tags::AFL, &tmpl.value[2..]);
            }
            // Format 2: proper TLVs under template 77.
            tags::RESPONSE_FORMAT2 => {
                let mut fields = TlvList::new();
                if tlv::parse_all(&mut fields, tmpl.value).is_err() {
                    return Err(Outcome::CardError.into());
                }
                if !fields.contains(tags::AIP) || !fields.contains(tags::AFL) {
                    return Err(Outcome::CardError.into());
                }
                self.icc.append(&mut fields);
            }
            _ => return Err(Outcome::CardError.into()),
        }
        debug!(aip = ?self.icc.get_value(tags::AIP), "processing options");
        self.state = State::GpoDone;
        Ok(())
    }

    // ---- Record reading -------------------------------------------------

    pub fn read_records(&mut self) -> Result<()> {
        self.require(State::GpoDone)?;
        let afl_bytes =
            self.icc.get_value(tags::AFL).ok_or(Error::from(Outcome::CardError))?.to_vec();
        let entries = afl::validate(&afl_bytes)?;
        let oda_total: usize = entries.iter().map(|e| e.oda_records as usize).sum();
        self.oda.reset(oda_total);

        for entry in &entries {
            for record in entry.records() {
                let res = self.ttl.read_record(entry.sfi, record)?;
                if !res.sw.is_ok() {
                    warn!(sw = %res.sw, sfi = entry.sfi, record, "READ RECORD failed");
                    return Err(Outcome::CardError.into());
                }
                let for_oda = record - entry.first < entry.oda_records;
                if entry.sfi <= 10 {
                    // Working records must be a single 70 template with
                    // nothing trailing it.
                    let (view, used) = ber::decode_one(&res.data)
                        .map_err(|_| Error::from(Outcome::CardError))?;
                    if view.tag != tags::RECORD_TEMPLATE || used != res.data.len() {
                        return Err(Outcome::CardError.into());
                    }
                    if for_oda {
                        self.oda.append(&res.data)?;
                    }
                    self.absorb_record(view.value)?;
                } else if for_oda {
                    // Proprietary files: hash the record value when it is
                    // TLV-wrapped, the raw record otherwise.
                    match ber::decode_one(&res.data) {
                        Ok((view, used)) if used == res.data.len() => {
                            self.oda.append(view.value)?
                        }
                        _ => self.oda.append(&res.data)?,
                    }
                }
            }
        }

        for mandatory in [tags::PAN, tags::CDOL1, tags::CDOL2] {
            if !self.icc.contains(mandatory) {
                warn!("mandatory data element missing: {:X}", mandatory);
                return Err(Outcome::CardError.into());
            }
        }
        self.state = State::RecordsRead;
        Ok(())
    }

    /// Flattens one record into the ICC list. A field that already exists
    /// anywhere in the list is redundant data, which EMV treats as a card
    /// defect.
    fn absorb_record(&mut self, record_value: &[u8]) -> Result<()> {
        let mut fields = TlvList::new();
        if tlv::parse_all(&mut fields, record_value).is_err() {
            return Err(Outcome::CardError.into());
        }
        while let Some(field) = fields.pop_front() {
            if self.icc.contains(field.tag) {
                warn!("redundant data element: {:X}", field.tag);
                return Err(Outcome::CardError.into());
            }
            self.icc.push(field);
        }
        Ok(())
    }

    // ---- Offline data authentication ------------------------------------

    /// Picks the strongest mutually supported method (CDA > DDA > SDA) and
    /// runs it. Authentication failures do not abort the transaction: they
    /// set the relevant TVR bit and the caller decides during risk
    /// management. Transport failures abort as usual.
    pub fn authenticate(&mut self) -> Result<()> {
        self.require(State::RecordsRead)?;
        let aip = self
            .icc
            .get_value(tags::AIP)
            .and_then(|v| v.first().copied())
            .ok_or(Error::from(Outcome::CardError))?;
        let caps = self
            .lookup(tags::TERMINAL_CAPABILITIES)
            .and_then(|v| v.get(2).copied())
            .unwrap_or(0);

        let method = if aip & 0x01 != 0 && caps & 0x08 != 0 {
            OdaMethod::Combined
        } else if aip & 0x20 != 0 && caps & 0x40 != 0 {
            OdaMethod::Dynamic
        } else if aip & 0x40 != 0 && caps & 0x80 != 0 {
            OdaMethod::Static
        } else {
            OdaMethod::None
        };
        self.oda.method = Some(method);
        debug!(?method, "offline data authentication");

        if method == OdaMethod::None {
            self.tvr.set(TvrBit::OdaNotPerformed);
            self.sync_status();
            self.state = State::OdaDone;
            return Ok(());
        }

        let result = match method {
            OdaMethod::Static => self.do_sda(),
            OdaMethod::Dynamic => self.do_dda(),
            OdaMethod::Combined => self.do_cda(),
            OdaMethod::None => unreachable!(),
        };
        self.tsi.set(TsiBit::OdaPerformed);
        self.sync_status();
        result?;
        self.state = State::OdaDone;
        Ok(())
    }

    /// The authenticated static data: the record buffer, plus the AIP when
    /// the card's SDA Tag List asks for it. A tag list naming anything but
    /// the AIP is malformed.
    fn static_data(&self) -> Option<Vec<u8>> {
        let mut data = self.oda.records.clone();
        if let Some(list) = self.icc.get_value(tags::SDA_TAG_LIST) {
            if list != [0x82] {
                warn!("static data tag list references more than the AIP");
                return None;
            }
            data.extend_from_slice(self.icc.get_value(tags::AIP)?);
        }
        Some(data)
    }

    /// Issuer key recovery, common to all three methods. `None` means the
    /// chain could not even start; TVR bits were set.
    fn recover_issuer(&mut self, fail_bit: TvrBit) -> Result<Option<cert::IssuerPublicKey>> {
        let aid = self.icc.get_value(tags::AID).unwrap_or_default();
        let (Some(index), Some(cert_bytes)) = (
            self.icc.get_value(tags::CAPK_INDEX).and_then(|v| v.first().copied()),
            self.icc.get_value(tags::ISSUER_CERT),
        ) else {
            self.tvr.set(TvrBit::IccDataMissing);
            self.tvr.set(fail_bit);
            return Ok(None);
        };
        let Some(capk) = self.capk.lookup(aid, index) else {
            warn!(index, "no CA public key for this RID/index");
            self.tvr.set(TvrBit::IccDataMissing);
            self.tvr.set(fail_bit);
            return Ok(None);
        };
        let pan = self.icc.get_value(tags::PAN);
        match cert::recover_issuer_key(self.crypto, capk, cert_bytes, &self.icc, pan) {
            Ok(rec) => match rec.key {
                Some(key) => Ok(Some(key)),
                None => {
                    // Decryption fine, inputs for the full chain absent.
                    self.tvr.set(TvrBit::IccDataMissing);
                    self.tvr.set(fail_bit);
                    Ok(None)
                }
            },
            Err(e) => {
                warn!(error = %e, "issuer key recovery failed");
                self.tvr.set(fail_bit);
                Ok(None)
            }
        }
    }

    fn do_sda(&mut self) -> Result<()> {
        let Some(issuer) = self.recover_issuer(TvrBit::SdaFailed)? else {
            return Ok(());
        };
        let Some(ssad) = self.icc.get_value(tags::SSAD).map(<[u8]>::to_vec) else {
            self.tvr.set(TvrBit::IccDataMissing);
            self.tvr.set(TvrBit::SdaFailed);
            return Ok(());
        };
        let Some(static_data) = self.static_data() else {
            self.tvr.set(TvrBit::SdaFailed);
            return Ok(());
        };
        match cert::verify_ssad(self.crypto, &issuer, &ssad, &static_data) {
            Ok(recovered) => {
                self.icc.put(tags::DAC, recovered.dac.to_vec());
            }
            Err(e) => {
                warn!(error = %e, "static data authentication failed");
                self.tvr.set(TvrBit::SdaFailed);
            }
        }
        Ok(())
    }

    /// Chain to the ICC key, shared by DDA and CDA.
    fn recover_icc(&mut self, fail_bit: TvrBit) -> Result<Option<IccPublicKey>> {
        let Some(issuer) = self.recover_issuer(fail_bit)? else {
            return Ok(None);
        };
        let Some(cert_bytes) = self.icc.get_value(tags::ICC_CERT).map(<[u8]>::to_vec) else {
            self.tvr.set(TvrBit::IccDataMissing);
            self.tvr.set(fail_bit);
            return Ok(None);
        };
        let Some(static_data) = self.static_data() else {
            self.tvr.set(fail_bit);
            return Ok(None);
        };
        let pan = self.icc.get_value(tags::PAN);
        match cert::recover_icc_key(self.crypto, &issuer, &cert_bytes, &self.icc, pan, &static_data)
        {
            Ok(rec) => match rec.key {
                Some(key) => Ok(Some(key)),
                None => {
                    self.tvr.set(TvrBit::IccDataMissing);
                    self.tvr.set(fail_bit);
                    Ok(None)
                }
            },
            Err(e) => {
                warn!(error = %e, "ICC key recovery failed");
                self.tvr.set(fail_bit);
                Ok(None)
            }
        }
    }

    fn do_dda(&mut self) -> Result<()> {
        let Some(icc_key) = self.recover_icc(TvrBit::DdaFailed)? else {
            return Ok(());
        };
        // The card's DDOL, the configured default, or the specification
        // default of just the Unpredictable Number.
        let ddol = self
            .icc
            .get_value(tags::DDOL)
            .or_else(|| self.config.get_value(tags::DDOL))
            .unwrap_or(&[0x9F, 0x37, 0x04])
            .to_vec();
        if !dol_mentions(&ddol, tags::UNPREDICTABLE_NUMBER) {
            warn!("DDOL without an Unpredictable Number entry");
            self.tvr.set(TvrBit::DdaFailed);
            return Ok(());
        }
        let ddol_data = dol::build_vec(&ddol, &self.sources())?;

        let res = self.ttl.internal_authenticate(&ddol_data)?;
        if !res.sw.is_ok() {
            warn!(sw = %res.sw, "INTERNAL AUTHENTICATE refused");
            self.tvr.set(TvrBit::DdaFailed);
            return Ok(());
        }
        let Some(sdad) = extract_sdad(&res.data) else {
            self.tvr.set(TvrBit::DdaFailed);
            return Ok(());
        };
        match cert::verify_sdad(self.crypto, &icc_key, &sdad, &ddol_data, false) {
            Ok(dynamic) => {
                self.icc.put(tags::ICC_DYNAMIC_NUMBER, dynamic.icc_dynamic_number);
            }
            Err(e) => {
                warn!(error = %e, "dynamic data authentication failed");
                self.tvr.set(TvrBit::DdaFailed);
            }
        }
        Ok(())
    }

    /// Combined authentication defers the signature to GENERATE AC; here we
    /// only retrieve and cache the ICC key.
    fn do_cda(&mut self) -> Result<()> {
        if let Some(key) = self.recover_icc(TvrBit::CdaFailed)? {
            self.oda.icc_key = Some(key);
        }
        Ok(())
    }

    // ---- Processing restrictions ----------------------------------------

    pub fn process_restrictions(&mut self) -> Result<()> {
        self.require(State::OdaDone)?;

        if let (Some(card), Some(term)) = (
            self.icc.get_value(tags::APP_VERSION_ICC),
            self.lookup(tags::APP_VERSION_TERMINAL),
        ) {
            if card != term {
                self.tvr.set(TvrBit::AppVersionsDiffer);
            }
        }

        if let Some(auc) = self.icc.get_value(tags::APP_USAGE_CONTROL).map(<[u8]>::to_vec) {
            self.check_usage(&auc);
        }

        if let Some(today) = self.lookup(tags::TRANSACTION_DATE).map(<[u8]>::to_vec) {
            if let Some(effective) = self.icc.get_value(tags::EFFECTIVE_DATE) {
                if date::is_not_effective(&today, effective) {
                    self.tvr.set(TvrBit::AppNotYetEffective);
                }
            }
            if let Some(expiry) = self.icc.get_value(tags::EXPIRY_DATE) {
                if date::is_expired(&today, expiry) {
                    self.tvr.set(TvrBit::ExpiredApplication);
                }
            }
        }

        self.sync_status();
        self.state = State::RestrictionsDone;
        Ok(())
    }

    /// Application Usage Control (EMV Book 3, §10.4): is this card allowed
    /// to do what the terminal is asking, where the terminal is?
    fn check_usage(&mut self, auc: &[u8]) {
        let auc0 = auc.first().copied().unwrap_or(0);
        let auc1 = auc.get(1).copied().unwrap_or(0);

        let term_type = self.lookup(tags::TERMINAL_TYPE).and_then(|v| v.first().copied());
        let cash_capable = self
            .lookup(tags::ADDITIONAL_CAPABILITIES)
            .and_then(|v| v.first().copied())
            .map(|b| b & 0x80 != 0)
            .unwrap_or(true);
        let is_atm = matches!(term_type, Some(0x14 | 0x15 | 0x16)) && cash_capable;

        if is_atm {
            if auc0 & 0x02 == 0 {
                self.tvr.set(TvrBit::ServiceNotAllowed);
                return;
            }
        } else if auc0 & 0x01 == 0 {
            self.tvr.set(TvrBit::ServiceNotAllowed);
            return;
        }

        // Domestic/international checks need the issuer's country.
        let (Some(term_country), Some(issuer_country)) = (
            self.lookup(tags::TERMINAL_COUNTRY),
            self.icc.get_value(tags::ISSUER_COUNTRY),
        ) else {
            return;
        };
        let domestic = term_country == issuer_country;
        let tx_type = self
            .lookup(tags::TRANSACTION_TYPE)
            .and_then(|v| v.first().copied())
            .unwrap_or(0x00);
        let cashback = self
            .lookup(tags::AMOUNT_OTHER)
            .map(|v| v.iter().any(|&b| b != 0))
            .unwrap_or(false);

        let allowed = match tx_type {
            // Cash withdrawal.
            0x01 | 0x17 => auc0 & (if domestic { 0x80 } else { 0x40 }) != 0,
            // Purchase with cashback, explicit or via Amount, Other.
            0x09 => auc1 & (if domestic { 0x80 } else { 0x40 }) != 0,
            // Purchase of goods or services.
            0x00 => {
                let goods_services =
                    auc0 & (if domestic { 0x20 | 0x08 } else { 0x10 | 0x04 }) != 0;
                let cashback_ok =
                    !cashback || auc1 & (if domestic { 0x80 } else { 0x40 }) != 0;
                goods_services && cashback_ok
            }
            _ => true,
        };
        if !allowed {
            self.tvr.set(TvrBit::ServiceNotAllowed);
        }
    }

    // ---- GENERATE AC ----------------------------------------------------

    /// First GENERATE AC. For combined authentication the response carries
    /// the SDAD, which is verified here against the cached PDOL/CDOL data;
    /// a failure sets the TVR bit and withholds the cryptogram.
    pub fn generate_ac(&mut self, ac: AcType) -> Result<GenAc> {
        self.require(State::RestrictionsDone)?;
        let cdol1 =
            self.icc.get_value(tags::CDOL1).ok_or(Error::from(Outcome::CardError))?.to_vec();
        let cdol1_data = dol::build_vec(&cdol1, &self.sources())?;
        self.oda.cdol1_data = cdol1_data.clone();

        let combined = self.oda.method == Some(OdaMethod::Combined) && self.oda.icc_key.is_some();
        let signature = if combined { AcSignature::Cda } else { AcSignature::None };
        let res = self.ttl.generate_ac(ac, signature, &cdol1_data)?;
        if !res.sw.is_ok() {
            warn!(sw = %res.sw, "GENERATE AC refused");
            return Err(Outcome::CardError.into());
        }

        let (tmpl, used) =
            ber::decode_one(&res.data).map_err(|_| Error::from(Outcome::CardError))?;
        if used != res.data.len() {
            return Err(Outcome::CardError.into());
        }
        let result = match tmpl.tag {
            tags::RESPONSE_FORMAT1 => {
                // CID, ATC, cryptogram, then optional issuer data.
                if combined || tmpl.value.len() < 11 {
                    return Err(Outcome::CardError.into());
                }
                let v = tmpl.value;
                self.icc.put(tags::CID, &v[..1]);
                self.icc.put(tags::ATC, &v[1..3]);
                self.icc.put(tags::CRYPTOGRAM, &v[3..11]);
                let iad = (v.len() > 11).then(|| v[11..].to_vec());
                if let Some(iad) = &iad {
                    self.icc.put(tags::IAD, iad.clone());
                }
                let mut atc = [0u8; 2];
                atc.copy_from_slice(&v[1..3]);
                let mut cryptogram = [0u8; 8];
                cryptogram.copy_from_slice(&v[3..11]);
                GenAc { cid: v[0], atc, cryptogram: Some(cryptogram), iad }
            }
            tags::RESPONSE_FORMAT2 => self.parse_genac_format2(tmpl.value, combined)?,
            _ => return Err(Outcome::CardError.into()),
        };
        self.sync_status();
        self.state = State::Terminated;
        Ok(result)
    }

    fn parse_genac_format2(&mut self, value: &[u8], combined: bool) -> Result<GenAc> {
        let mut fields = TlvList::new();
        let mut sdad = None;
        // Combined authentication hashes the response TLVs minus the
        // signature itself, in wire order.
        let mut without_sdad = Vec::new();
        for item in ber::iter(value) {
            let view = item.map_err(|_| Error::from(Outcome::CardError))?;
            if view.tag == tags::SDAD {
                sdad = Some(view.value.to_vec());
            } else {
                ber::encode_one(&mut without_sdad, view.tag, view.value);
                fields.push(Tlv::from_view(&view));
            }
        }
        self.oda.genac_without_sdad = without_sdad;

        let cid = fields
            .get_value(tags::CID)
            .and_then(|v| v.first().copied())
            .ok_or(Error::from(Outcome::CardError))?;
        let atc_bytes = fields.get_value(tags::ATC).ok_or(Error::from(Outcome::CardError))?;
        if atc_bytes.len() != 2 {
            return Err(Outcome::CardError.into());
        }
        let mut atc = [0u8; 2];
        atc.copy_from_slice(atc_bytes);
        let iad = fields.get_value(tags::IAD).map(<[u8]>::to_vec);

        let mut cryptogram =
            fields.get_value(tags::CRYPTOGRAM).and_then(|v| <[u8; 8]>::try_from(v).ok());

        if combined {
            cryptogram = self.verify_combined(sdad.as_deref(), cid);
        }

        while let Some(field) = fields.pop_front() {
            self.icc.push(field);
        }
        Ok(GenAc { cid, atc, cryptogram, iad })
    }

    /// The deferred combined-authentication check: recover the SDAD with
    /// the cached ICC key and rebuild the transaction data hash from the
    /// PDOL data, CDOL1 data and the response TLVs.
    fn verify_combined(&mut self, sdad: Option<&[u8]>, cid: u8) -> Option<[u8; 8]> {
        let Some(sdad) = sdad else {
            warn!("combined authentication requested but no SDAD returned");
            self.tvr.set(TvrBit::CdaFailed);
            return None;
        };
        let Some(icc_key) = self.oda.icc_key.as_ref() else {
            self.tvr.set(TvrBit::CdaFailed);
            return None;
        };
        let un = self.lookup(tags::UNPREDICTABLE_NUMBER).unwrap_or_default().to_vec();
        let dynamic = match cert::verify_sdad(self.crypto, icc_key, sdad, &un, true) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "combined authentication failed");
                self.tvr.set(TvrBit::CdaFailed);
                return None;
            }
        };
        let tx_hash = crypto::digest(
            HashAlgo::Sha1,
            &[&self.oda.pdol_data, &self.oda.cdol1_data, &self.oda.genac_without_sdad],
        );
        if dynamic.tx_data_hash.map(|h| h.to_vec()) != Some(tx_hash) {
            warn!("transaction data hash mismatch");
            self.tvr.set(TvrBit::CdaFailed);
            return None;
        }
        if dynamic.cid != Some(cid) {
            warn!("cryptogram information data mismatch");
            self.tvr.set(TvrBit::CdaFailed);
            return None;
        }
        self.icc.put(tags::ICC_DYNAMIC_NUMBER, dynamic.icc_dynamic_number.clone());
        dynamic.cryptogram
    }

    // ---- GET DATA -------------------------------------------------------

    /// Fetches a primitive data object (ATC, last online ATC, PIN try
    /// counter...) and stores it in the ICC list. Usable any time after
    /// application selection.
    pub fn fetch_data(&mut self, tag: ber::Tag) -> Result<Vec<u8>> {
        if matches!(self.state, State::Init | State::AtrValidated | State::CandidatesBuilt) {
            return Err(Error::State { expected: State::AppSelected, actual: self.state });
        }
        let res = self.ttl.get_data(tag)?;
        if !res.sw.is_ok() {
            return Err(Error::Apdu(res.sw));
        }
        let (view, used) = ber::decode_one(&res.data).map_err(|_| Error::from(Outcome::CardError))?;
        if view.tag != tag || used != res.data.len() {
            return Err(Outcome::CardError.into());
        }
        let value = view.value.to_vec();
        self.icc.set(tag, value.clone());
        Ok(value)
    }
}

/// Does a DOL contain an entry for `tag`?
fn dol_mentions(dol_bytes: &[u8], tag: ber::Tag) -> bool {
    dol::iter(dol_bytes).any(|e| matches!(e, Ok(entry) if entry.tag == tag))
}

/// INTERNAL AUTHENTICATE responses come in both template formats; either
/// way the payload is the SDAD.
fn extract_sdad(data: &[u8]) -> Option<Vec<u8>> {
    let (tmpl, used) = ber::decode_one(data).ok()?;
    if used != data.len() {
        return None;
    }
    match tmpl.tag {
        tags::RESPONSE_FORMAT1 => Some(tmpl.value.to_vec()),
        tags::RESPONSE_FORMAT2 => {
            for item in ber::iter(tmpl.value) {
                if let Ok(view) = item {
                    if view.tag == tags::SDAD {
                        return Some(view.value.to_vec());
                    }
                }
            }
            None
        }
        _ => None,
    }
}
