//! Minimal example: a TLS 1.3 key schedule run entirely on the software
//! secure element.
//!
//! A client and a server session share one device. They exchange key
//! shares, walk the schedule, sign and check a CertificateVerify, swap
//! Finished MACs and one application record, then close. The audit trail
//! is written to a file.
//!
//! Run with: `RUST_LOG=tlsvault=debug cargo run --example full_handshake`

use tlsvault::audit::FileAuditSink;
use tlsvault::emulator::SoftElement;
use tlsvault::{CipherSuite, NamedGroup, Phase, ProvisionedKey, RecordNonce, Side, Vault};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tlsvault=info")))
        .init();

    // 1. Setup
    let suite = CipherSuite::Tls13Aes128GcmSha256;
    let mut element = SoftElement::new();
    let certificate_key = element.provision_signing_key(0x2000);
    let vault = Vault::new(element);
    let audit_path = std::env::temp_dir().join("tlsvault_audit.jsonl");
    vault.add_audit_sink(Box::new(FileAuditSink::new(&audit_path)?));

    let mut client = vault.begin_handshake(Side::Client, suite)?;
    let mut server = vault.begin_handshake(Side::Server, suite)?;

    // 2. Key exchange
    let client_share = client.generate_key_share(NamedGroup::X25519)?;
    let server_share = server.generate_key_share(NamedGroup::X25519)?;
    let client_shared = client.compute_shared_secret(&server_share)?;
    let server_shared = server.compute_shared_secret(&client_share)?;

    // 3. Handshake secrets
    let hello_hash = suite.digest().hash(b"ClientHello...ServerHello");
    for (session, shared) in [(&mut client, client_shared), (&mut server, server_shared)] {
        session.derive_early_secret()?;
        session.derive_handshake_secret(shared)?;
        session.derive_traffic_secrets(Phase::Handshake, &hello_hash)?;
        session.derive_finished_key(Side::Client)?;
        session.derive_finished_key(Side::Server)?;
    }
    println!("handshake keys ready, {} slot(s) in use", vault.allocated_slots());

    // 4. CertificateVerify
    let certificate_hash = suite.digest().hash(b"ClientHello...Certificate");
    let signature = server.sign_handshake(ProvisionedKey::new(0x2000), &certificate_hash)?;
    client.verify_peer_signature(&certificate_key, &certificate_hash, &signature)?;
    println!("CertificateVerify checked ({} byte signature)", signature.len());

    // 5. Server Finished
    let transcript = suite.digest().hash(b"ClientHello...CertificateVerify");
    let finished = {
        let mut mac = server.finished_mac(Side::Server)?;
        mac.update(&transcript)?;
        mac.finish()?
    };
    {
        let mut mac = client.finished_mac(Side::Server)?;
        mac.update(&transcript)?;
        mac.verify(&finished)?;
    }
    println!("server Finished verified");

    // 6. Application keys; the client Finished exchange is skipped here,
    //    so both directions leave their handshake keys straight away.
    let finished_hash = suite.digest().hash(b"ClientHello...server Finished");
    for session in [&mut client, &mut server] {
        session.derive_master_secret()?;
        session.derive_traffic_secrets(Phase::Application, &finished_hash)?;
        session.retire_handshake_key(Side::Client)?;
        session.retire_handshake_key(Side::Server)?;
    }

    // 7. One application record
    let request = client.seal_record(RecordNonce::Sequence(0), b"", b"GET / HTTP/1.1\r\n\r\n")?;
    let opened = server.open_record(RecordNonce::Sequence(0), b"", &request.ciphertext, &request.tag)?;
    println!("server received: {:?}", String::from_utf8_lossy(&opened));

    // 8. Close
    let released = client.close() + server.close();
    println!("closed, {released} slot(s) released, {} in use", vault.allocated_slots());
    println!("Audit log written to {}", audit_path.display());

    Ok(())
}
