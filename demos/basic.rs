use flowfilter::{compile, EvalContext, FilterError, FlowRecord, RecordField};

fn main() -> Result<(), FilterError> {
    // 1. Compile a filter once, off the hot path
    let filter = compile("proto tcp and dst port 443 and src net 172.16/16 and not flags R")?;
    println!("Compiled program:\n{filter}");

    // 2. Build a record the way the record-storage side would
    let mut record = FlowRecord::new();
    record
        .set(RecordField::Proto, 6)
        .set(RecordField::SrcPort, 40000)
        .set(RecordField::DstPort, 443)
        .set(RecordField::TcpFlags, 18);
    record.set_src_addr("172.16.2.7".parse().unwrap());
    record.set_dst_addr("10.10.10.11".parse().unwrap());

    // 3. Evaluate as many records as needed against the shared program
    let ctx = EvalContext::new();
    println!("Filter matches: {}", filter.evaluate(&record, &ctx));

    // 4. ident filters consult the evaluation context
    let per_channel = compile("ident upstream1 and proto tcp")?;
    let ctx = EvalContext::with_ident("upstream1");
    println!("Channel filter matches: {}", per_channel.evaluate(&record, &ctx));
    Ok(())
}
