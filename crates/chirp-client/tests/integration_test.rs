//! End-to-end client operations against a scripted server

mod common;

use chirp_client::{ChirpStatus, Client, DirListing, Error, IoOptions};
use common::*;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

#[test]
fn test_job_attributes() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line("set_job_attr Foo 1", &["0"])]),
        authed(vec![with_payload("get_job_attr Foo", b"1")]),
        authed(vec![with_payload("get_job_attr_delayed Foo", b"0")]),
        authed(vec![line("set_job_attr_delayed Progress 0.5", &["0"])]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    client.set_job_attr("Foo", "1").unwrap();
    assert_eq!(client.get_job_attr("Foo").unwrap(), "1");
    assert_eq!(client.get_job_attr_delayed("Foo").unwrap(), "0");
    client.set_job_attr_delayed("Progress", "0.5").unwrap();

    let transcripts = server.finish();
    assert_eq!(transcripts[0], session(&[]));
    assert_eq!(transcripts[1], session(&["set_job_attr Foo 1"]));
    assert_eq!(transcripts[2], session(&["get_job_attr Foo"]));
}

#[test]
fn test_ulog_and_phase_escape_spaces() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line("ulog hello\\ world", &["0"])]),
        authed(vec![line("phase stage\\ two", &["0"])]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    client.ulog("hello world").unwrap();
    client.phase("stage two").unwrap();

    let transcripts = server.finish();
    assert_eq!(transcripts[1], session(&["ulog hello\\ world"]));
    assert_eq!(transcripts[2], session(&["phase stage\\ two"]));
}

#[test]
fn test_getdir_and_getlongdir() {
    let long = format!("x\n{}\ny\n{}\n", stat_line(10), stat_line(20));
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![with_payload("getdir /a", b"x\ny\n")]),
        authed(vec![with_payload("getlongdir /a", long.as_bytes())]),
        authed(vec![with_payload("getdir /empty", b"")]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    assert_eq!(client.getdir("/a").unwrap(), vec!["x", "y"]);

    match client.listdir("/a", true).unwrap() {
        DirListing::Long(entries) => {
            assert_eq!(entries.len(), 2);
            assert_eq!(entries["x"].size, 10);
            assert_eq!(entries["y"].size, 20);
            assert_eq!(entries["y"].mode, 33188);
        }
        other => panic!("expected a long listing, got {other:?}"),
    }

    assert!(client.getdir("/empty").unwrap().is_empty());
    server.finish();
}

#[test]
fn test_positional_write_reports_server_count() {
    let data = vec![b'z'; 100];
    let stat = stat_line(0);
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![
            line("open /data/out.bin wtc 511", &["3", stat.as_str()]),
            silent("pwrite 3 100 50"),
            payload(100, &["64"]),
            line("fsync 3", &["0"]),
            line("close 3", &["0"]),
        ]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    let written = client
        .write(&data, "/data/out.bin", "wct", None, None, IoOptions::at(50))
        .unwrap();
    assert_eq!(written, 64);

    let transcripts = server.finish();
    let mut expected = lines(&[
        "cookie abc123",
        "open /data/out.bin wtc 511",
        "pwrite 3 100 50",
    ]);
    expected.push(Received::Payload(data));
    expected.extend(lines(&["fsync 3", "close 3"]));
    expected.push(Received::Closed);
    assert_eq!(transcripts[1], expected);
}

#[test]
fn test_write_requires_write_flag() {
    let server = MockServer::start(vec![handshake()]);
    let mut client = Client::connect(&server.config()).unwrap();

    let result = client.write(b"abc", "/f", "r", None, None, IoOptions::default());
    assert!(matches!(result, Err(Error::InvalidFlags(_))));

    let result = client.write(b"abc", "/f", "wq", None, None, IoOptions::default());
    assert!(matches!(result, Err(Error::InvalidFlags(_))));

    // Only the handshake connection was ever made
    assert_eq!(server.finish().len(), 1);
}

#[test]
fn test_strided_read() {
    let stat = stat_line(4096);
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![
            line("open /data/in r 511", &["5", stat.as_str()]),
            with_payload("sread 5 100 0 10 20", b"abcd"),
            line("close 5", &["0"]),
        ]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    let data = client
        .read("/data/in", 100, IoOptions::strided(10, 20))
        .unwrap();
    assert_eq!(data, b"abcd");
    server.finish();
}

#[test]
fn test_put_default_uses_putfile() {
    let mut local = NamedTempFile::new().unwrap();
    local.write_all(b"hello world").unwrap();

    let server = MockServer::start(vec![
        handshake(),
        authed(vec![
            line("putfile /r/hello.txt 420 11", &["0"]),
            payload(11, &["11"]),
        ]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    let stored = client
        .put(local.path(), "/r/hello.txt", "wct", Some(0o644))
        .unwrap();
    assert_eq!(stored, 11);

    let transcripts = server.finish();
    assert_eq!(
        transcripts[1][2],
        Received::Payload(b"hello world".to_vec())
    );
}

#[test]
fn test_put_short_write() {
    let mut local = NamedTempFile::new().unwrap();
    local.write_all(b"0123456789").unwrap();
    let stat = stat_line(0);

    let server = MockServer::start(vec![
        handshake(),
        authed(vec![
            line("open /r/log w 511", &["4", stat.as_str()]),
            silent("write 4 10"),
            payload(10, &["6"]),
            line("fsync 4", &["0"]),
            line("close 4", &["0"]),
        ]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    let result = client.put(local.path(), "/r/log", "w", None);
    assert!(matches!(
        result,
        Err(Error::ShortWrite {
            written: 6,
            expected: 10
        })
    ));
    server.finish();
}

#[test]
fn test_fetch_streams_large_file() {
    let contents: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![with_payload("getfile /r/big.bin", &contents)]),
    ]);

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("big.bin");

    let mut client = Client::connect(&server.config()).unwrap();
    assert_eq!(client.fetch("/r/big.bin", &local).unwrap(), 3000);
    assert_eq!(std::fs::read(&local).unwrap(), contents);
    server.finish();
}

#[test]
fn test_getfile_missing_leaves_no_local_file() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line("getfile /r/missing", &["-3"])]),
    ]);

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("missing");

    let mut client = Client::connect(&server.config()).unwrap();
    let result = client.getfile("/r/missing", &local);
    assert!(matches!(
        result,
        Err(Error::Status(ChirpStatus::DoesntExist))
    ));
    assert!(!local.exists());
    server.finish();
}

#[test]
fn test_getfile_interrupted_removes_partial_file() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line("getfile /r/part", &["10", "abc"]), hangup()]),
    ]);

    let dir = TempDir::new().unwrap();
    let local = dir.path().join("part");

    let mut client = Client::connect(&server.config()).unwrap();
    let result = client.getfile("/r/part", &local);
    assert!(matches!(result, Err(Error::ConnectionBroken(_))));
    assert!(!local.exists());
    server.finish();
}

#[test]
fn test_stat_spans_lines() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line(
            "stat /x",
            &[
                "0",
                "2049 1234 33188 1 1000 1000",
                "0 512 4096 8 1700000000 1700000001 1700000002",
            ],
        )]),
        authed(vec![line("lstat /link", &["0", stat_line(7).as_str()])]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    let stat = client.stat("/x").unwrap();
    assert_eq!(stat.size, 512);
    assert_eq!(stat.uid, 1000);
    assert_eq!(stat.modified().unwrap().timestamp(), 1_700_000_001);

    assert_eq!(client.lstat("/link").unwrap().size, 7);
    server.finish();
}

#[test]
fn test_statfs() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line("statfs /", &["0", "61267 4096 1000 500 400 64000 32000"])]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    let statfs = client.statfs("/").unwrap();
    assert_eq!(statfs.f_bsize, 4096);
    assert_eq!(statfs.f_free, 32000);
    server.finish();
}

#[test]
fn test_access_denied() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line("access /secret 4", &["-2"])]),
        authed(vec![line("access /public 6", &["0"])]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    assert!(matches!(
        client.access("/secret", "r"),
        Err(Error::Status(ChirpStatus::NotAuthorized))
    ));
    client.access("/public", "rw").unwrap();
    assert!(matches!(
        client.access("/public", "q"),
        Err(Error::InvalidAccessMode('q'))
    ));

    let transcripts = server.finish();
    assert_eq!(transcripts.len(), 3);
    assert_eq!(transcripts[1], session(&["access /secret 4"]));
}

#[test]
fn test_namespace_operations() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line("mkdir /new 511", &["0"])]),
        authed(vec![line("rmall /old", &["0"])]),
        authed(vec![line("rmdir /empty", &["0"])]),
        authed(vec![line("symlink /target /link", &["0"])]),
        authed(vec![line("link /target /hard", &["0"])]),
        authed(vec![with_payload("readlink /link 1024", b"/target")]),
        authed(vec![line("rename my\\ file new\\ file", &["0"])]),
        authed(vec![line("unlink /gone", &["0"])]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    client.mkdir("/new", None).unwrap();
    client.rmdir("/old", true).unwrap();
    client.rmdir("/empty", false).unwrap();
    client.link("/target", "/link", true).unwrap();
    client.link("/target", "/hard", false).unwrap();
    assert_eq!(client.readlink("/link").unwrap(), "/target");
    client.rename("my file", "new file").unwrap();
    client.remove("/gone").unwrap();

    let transcripts = server.finish();
    assert_eq!(transcripts.len(), 9);
    for transcript in &transcripts {
        assert_eq!(transcript.last(), Some(&Received::Closed));
    }
}

#[test]
fn test_metadata_updates() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line("chmod /f 420", &["0"])]),
        authed(vec![line("chown /f 1000 100", &["0"])]),
        authed(vec![line("lchown /l 0 0", &["0"])]),
        authed(vec![line("truncate /f 0", &["0"])]),
        authed(vec![line("utime /f 1700000000 1700000001", &["0"])]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    client.chmod("/f", 0o644).unwrap();
    client.chown("/f", 1000, 100).unwrap();
    client.lchown("/l", 0, 0).unwrap();
    client.truncate("/f", 0).unwrap();
    client
        .utime("/f", 1_700_000_000, 1_700_000_001)
        .unwrap();
    server.finish();
}

#[test]
fn test_identity() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![with_payload("whoami 1024", b"unix:nobody")]),
        authed(vec![with_payload("whoareyou submit.example.org 1024", b"hostname:schedd")]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    assert_eq!(client.whoami().unwrap(), "unix:nobody");
    assert_eq!(
        client.whoareyou("submit.example.org").unwrap(),
        "hostname:schedd"
    );
    server.finish();
}

#[test]
fn test_failed_operation_does_not_poison_client() {
    let server = MockServer::start(vec![
        handshake(),
        authed(vec![line("unlink /x", &["-42"])]),
        authed(vec![line("unlink /y", &["0"])]),
    ]);

    let mut client = Client::connect(&server.config()).unwrap();
    match client.unlink("/x") {
        Err(Error::Status(ChirpStatus::Unknown(code))) => assert_eq!(code, -42),
        other => panic!("unexpected result: {other:?}"),
    }
    client.unlink("/y").unwrap();

    let transcripts = server.finish();
    assert_eq!(transcripts[1], session(&["unlink /x"]));
    assert_eq!(transcripts[2], session(&["unlink /y"]));
}
