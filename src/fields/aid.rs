//! Application Identifier (AID) recognition.
//!
//! An AID is 5..16 bytes: a 5-byte Registered Application Provider
//! Identifier (RID) followed by a Proprietary Application Identifier
//! Extension (PIX). The RID names the payment scheme; well-known PIX
//! prefixes name the product within it.

/// Payment schemes with registered RIDs this engine recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Visa,
    Mastercard,
    Amex,
    Discover,
    CartesBancaires,
    Jcb,
    Dankort,
    UnionPay,
    GimUemoa,
    Girocard,
    Verve,
    Eftpos,
    RuPay,
    Mir,
    Meeza,
    Unknown,
}

/// Card products distinguished by their PIX prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    /// The scheme's main credit/debit application.
    Default,
    Electron,
    VPay,
    Plus,
    Maestro,
    Cirrus,
    DPas,
    Zip,
    UnionPayDebit,
    UnionPayCredit,
    UnionPayQuasiCredit,
    UnionPayCash,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppId {
    pub scheme: Scheme,
    pub product: Product,
}

const RIDS: &[([u8; 5], Scheme)] = &[
    ([0xA0, 0x00, 0x00, 0x00, 0x03], Scheme::Visa),
    ([0xA0, 0x00, 0x00, 0x00, 0x04], Scheme::Mastercard),
    ([0xA0, 0x00, 0x00, 0x00, 0x25], Scheme::Amex),
    ([0xA0, 0x00, 0x00, 0x00, 0x42], Scheme::CartesBancaires),
    ([0xA0, 0x00, 0x00, 0x00, 0x65], Scheme::Jcb),
    ([0xA0, 0x00, 0x00, 0x01, 0x21], Scheme::Dankort),
    ([0xA0, 0x00, 0x00, 0x01, 0x52], Scheme::Discover),
    ([0xA0, 0x00, 0x00, 0x03, 0x33], Scheme::UnionPay),
    ([0xA0, 0x00, 0x00, 0x03, 0x37], Scheme::GimUemoa),
    ([0xA0, 0x00, 0x00, 0x03, 0x59], Scheme::Girocard),
    ([0xA0, 0x00, 0x00, 0x03, 0x71], Scheme::Verve),
    ([0xA0, 0x00, 0x00, 0x03, 0x84], Scheme::Eftpos),
    ([0xA0, 0x00, 0x00, 0x05, 0x24], Scheme::RuPay),
    ([0xA0, 0x00, 0x00, 0x06, 0x58], Scheme::Mir),
    ([0xA0, 0x00, 0x00, 0x07, 0x32], Scheme::Meeza),
];

/// PIX prefixes that name a specific product. Matched by prefix, so
/// `A0000000032010` and `A000000003201001` both come out as Electron.
const PRODUCTS: &[(Scheme, &[u8], Product)] = &[
    (Scheme::Visa, &[0x10, 0x10], Product::Default),
    (Scheme::Visa, &[0x20, 0x10], Product::Electron),
    (Scheme::Visa, &[0x20, 0x20], Product::VPay),
    (Scheme::Visa, &[0x80, 0x10], Product::Plus),
    (Scheme::Mastercard, &[0x10, 0x10], Product::Default),
    (Scheme::Mastercard, &[0x30, 0x60], Product::Maestro),
    (Scheme::Mastercard, &[0x60, 0x00], Product::Cirrus),
    (Scheme::Discover, &[0x30, 0x10], Product::DPas),
    (Scheme::Discover, &[0x40, 0x10], Product::Zip),
    (Scheme::UnionPay, &[0x01, 0x01, 0x01], Product::UnionPayDebit),
    (Scheme::UnionPay, &[0x01, 0x01, 0x02], Product::UnionPayCredit),
    (Scheme::UnionPay, &[0x01, 0x01, 0x03], Product::UnionPayQuasiCredit),
    (Scheme::UnionPay, &[0x01, 0x01, 0x06], Product::UnionPayCash),
];

/// Recognises the scheme by RID.
pub fn scheme(aid: &[u8]) -> Scheme {
    if aid.len() < 5 {
        return Scheme::Unknown;
    }
    RIDS.iter()
        .find(|(rid, _)| rid == &aid[..5])
        .map(|(_, s)| *s)
        .unwrap_or(Scheme::Unknown)
}

/// Recognises scheme and product from a full AID.
pub fn recognize(aid: &[u8]) -> AppId {
    let scheme = scheme(aid);
    if scheme == Scheme::Unknown {
        return AppId { scheme, product: Product::Unknown };
    }
    let pix = &aid[5..];
    let product = PRODUCTS
        .iter()
        .find(|(s, prefix, _)| *s == scheme && pix.len() >= prefix.len() && pix.starts_with(prefix))
        .map(|(_, _, p)| *p)
        .unwrap_or(Product::Unknown);
    AppId { scheme, product }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vpay() {
        let id = recognize(&[0xA0, 0x00, 0x00, 0x00, 0x03, 0x20, 0x20]);
        assert_eq!(id.scheme, Scheme::Visa);
        assert_eq!(id.product, Product::VPay);
    }

    #[test]
    fn test_cirrus() {
        let id = recognize(&[0xA0, 0x00, 0x00, 0x00, 0x04, 0x60, 0x00]);
        assert_eq!(id.scheme, Scheme::Mastercard);
        assert_eq!(id.product, Product::Cirrus);
    }

    #[test]
    fn test_scheme_only() {
        let id = recognize(&[0xA0, 0x00, 0x00, 0x00, 0x65, 0x10, 0x10]);
        assert_eq!(id.scheme, Scheme::Jcb);
        assert_eq!(id.product, Product::Unknown);
    }

    #[test]
    fn test_pix_prefix_match() {
        // Longer PIX still matches its product prefix.
        let id = recognize(&[0xA0, 0x00, 0x00, 0x00, 0x03, 0x20, 0x10, 0x01]);
        assert_eq!(id.product, Product::Electron);
    }

    #[test]
    fn test_unknown() {
        assert_eq!(scheme(&[0xA0, 0x00, 0x00, 0x09, 0x99]), Scheme::Unknown);
        assert_eq!(scheme(&[0xA0, 0x00]), Scheme::Unknown);
    }
}
