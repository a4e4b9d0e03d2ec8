use reftable::{LogExpiry, LogRecord, LogUpdate, LogValue, RefRecord, RefValue, Stack, WriteOptions};
use test_log::test;

fn log_update(name: &str, update_index: u64, time: u64) -> LogRecord {
    LogRecord {
        refname: name.into(),
        update_index,
        value: LogValue::Update(LogUpdate {
            old_hash: vec![1; 20],
            new_hash: vec![2; 20],
            name: "Jane Doe".into(),
            email: "jane@invalid".into(),
            time,
            tz_offset: 60,
            message: format!("update at {time}\n"),
        }),
    }
}

#[test]
fn read_log_returns_newest_entry() -> reftable::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut stack = Stack::new(dir.path(), WriteOptions::default())?;

    for update_index in 1..=3 {
        stack.add(move |writer| {
            writer.set_limits(update_index, update_index)?;
            writer.add_log(&log_update("refs/heads/main", update_index, 100 + update_index))
        })?;
    }

    let log = stack.read_log("refs/heads/main")?.expect("should exist");
    assert_eq!(3, log.update_index);

    let LogValue::Update(update) = log.value else {
        panic!("should be an update");
    };
    assert_eq!(103, update.time);
    assert_eq!("Jane Doe", update.name);

    Ok(())
}

#[test]
fn ref_and_log_in_one_table() -> reftable::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut stack = Stack::new(dir.path(), WriteOptions::default())?;

    stack.add(|writer| {
        writer.set_limits(1, 1)?;
        writer.add_ref(&RefRecord {
            refname: "refs/heads/main".into(),
            update_index: 1,
            value: RefValue::Val1(vec![2; 20]),
        })?;
        writer.add_log(&log_update("refs/heads/main", 1, 1_000))
    })?;

    assert!(stack.read_ref("refs/heads/main")?.is_some());
    assert!(stack.read_log("refs/heads/main")?.is_some());

    Ok(())
}

#[test]
fn log_expiry_by_time_and_update_index() -> reftable::Result<()> {
    let dir = tempfile::tempdir()?;
    let opts = WriteOptions {
        disable_auto_compact: true,
        ..Default::default()
    };
    let mut stack = Stack::new(dir.path(), opts)?;

    // branch01..branch20, times and update indices 1..20
    for i in 1..=20 {
        stack.add(move |writer| {
            writer.set_limits(i, i)?;
            writer.add_log(&log_update(&format!("branch{i:02}"), i, i))
        })?;
    }

    // expire entries older than time 10
    stack.compact_all(Some(LogExpiry {
        time: 10,
        min_update_index: 0,
    }))?;

    assert!(stack.read_log("branch09")?.is_none());
    assert!(stack.read_log("branch10")?.is_some());
    assert!(stack.read_log("branch11")?.is_some());

    // expire entries below update index 15
    stack.compact_all(Some(LogExpiry {
        time: 0,
        min_update_index: 15,
    }))?;

    assert!(stack.read_log("branch14")?.is_none());
    assert!(stack.read_log("branch16")?.is_some());

    Ok(())
}

#[test]
fn merged_log_iteration_newest_first_per_ref() -> reftable::Result<()> {
    let dir = tempfile::tempdir()?;
    let opts = WriteOptions {
        disable_auto_compact: true,
        ..Default::default()
    };
    let mut stack = Stack::new(dir.path(), opts)?;

    for update_index in 1..=3 {
        stack.add(move |writer| {
            writer.set_limits(update_index, update_index)?;
            writer.add_log(&log_update("refs/heads/main", update_index, update_index))
        })?;
    }

    let indices: Vec<_> = stack
        .merged()
        .log_iter()?
        .map(|l| l.map(|l| l.update_index))
        .collect::<reftable::Result<_>>()?;
    assert_eq!(vec![3, 2, 1], indices);

    // a pinned seek skips the newer entries
    let mut iter = stack.merged().seek_log_at("refs/heads/main", 2)?;
    let rec = iter.next().expect("should find log")?;
    assert_eq!(2, rec.update_index);

    Ok(())
}

#[test]
fn log_deletion_hides_entry() -> reftable::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut stack = Stack::new(dir.path(), WriteOptions::default())?;

    stack.add(|writer| {
        writer.set_limits(1, 1)?;
        writer.add_log(&log_update("refs/heads/main", 1, 100))
    })?;

    // deleting the same key shadows it in the merged view
    stack.add(|writer| {
        writer.set_limits(2, 2)?;
        writer.add_log(&LogRecord {
            refname: "refs/heads/main".into(),
            update_index: 2,
            value: LogValue::Deletion,
        })
    })?;

    assert!(stack.read_log("refs/heads/main")?.is_none());

    Ok(())
}

#[test]
fn messages_get_normalized() -> reftable::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut stack = Stack::new(dir.path(), WriteOptions::default())?;

    stack.add(|writer| {
        writer.set_limits(1, 1)?;
        let mut log = log_update("refs/heads/main", 1, 100);
        if let LogValue::Update(update) = &mut log.value {
            update.message = "no trailing newline".into();
        }
        writer.add_log(&log)
    })?;

    let log = stack.read_log("refs/heads/main")?.expect("should exist");
    let LogValue::Update(update) = log.value else {
        panic!("should be an update");
    };
    assert_eq!("no trailing newline\n", update.message);

    Ok(())
}
